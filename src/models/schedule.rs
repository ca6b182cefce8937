use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Manual,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

/// When a task runs. `time` is "HH:MM" (24h), `days` are weekday numbers
/// with 0 = Sunday, `day_of_month` is clamped to short months when evaluated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub frequency: Frequency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u32>,
}

impl Schedule {
    pub fn manual() -> Self {
        Self {
            frequency: Frequency::Manual,
            time: None,
            days: Vec::new(),
            day_of_month: None,
        }
    }

    pub fn hourly() -> Self {
        Self {
            frequency: Frequency::Hourly,
            ..Self::manual()
        }
    }

    pub fn daily(time: &str) -> Self {
        Self {
            frequency: Frequency::Daily,
            time: Some(time.to_string()),
            ..Self::manual()
        }
    }

    pub fn weekly(time: &str, days: Vec<u8>) -> Self {
        Self {
            frequency: Frequency::Weekly,
            time: Some(time.to_string()),
            days,
            day_of_month: None,
        }
    }

    pub fn monthly(time: &str, day_of_month: u32) -> Self {
        Self {
            frequency: Frequency::Monthly,
            time: Some(time.to_string()),
            days: Vec::new(),
            day_of_month: Some(day_of_month),
        }
    }

    /// Whether the frequency needs a time of day.
    pub fn requires_time(&self) -> bool {
        matches!(
            self.frequency,
            Frequency::Daily | Frequency::Weekly | Frequency::Monthly
        )
    }

    /// Parsed time of day, `None` when absent or malformed.
    pub fn time_of_day(&self) -> Option<NaiveTime> {
        self.time
            .as_deref()
            .and_then(|t| NaiveTime::parse_from_str(t.trim(), "%H:%M").ok())
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::daily("02:00")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_time_of_day() {
        let schedule = Schedule::daily("03:30");
        assert_eq!(
            schedule.time_of_day(),
            NaiveTime::from_hms_opt(3, 30, 0)
        );
        assert!(Schedule::daily("25:00").time_of_day().is_none());
        assert!(Schedule::manual().time_of_day().is_none());
    }

    #[test]
    fn test_deserializes_ui_shape() {
        let json = r#"{"frequency":"weekly","time":"03:00","days":[0]}"#;
        let schedule: Schedule = serde_json::from_str(json).unwrap();
        assert_eq!(schedule, Schedule::weekly("03:00", vec![0]));

        let json = r#"{"frequency":"monthly","time":"04:00","dayOfMonth":1}"#;
        let schedule: Schedule = serde_json::from_str(json).unwrap();
        assert_eq!(schedule.day_of_month, Some(1));
    }
}
