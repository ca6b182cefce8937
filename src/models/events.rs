use crate::models::run_record::RunRecord;
use crate::models::task::TaskStatus;
use serde::{Deserialize, Serialize};

/// Notifications published to subscribers instead of polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    #[serde(rename = "task.status")]
    TaskStatus { task_id: String, status: TaskStatus },

    #[serde(rename = "run.started")]
    RunStarted { task_id: String, run_id: String },

    #[serde(rename = "run.completed")]
    RunCompleted { record: RunRecord },
}

impl EngineEvent {
    pub fn task_id(&self) -> &str {
        match self {
            EngineEvent::TaskStatus { task_id, .. } => task_id,
            EngineEvent::RunStarted { task_id, .. } => task_id,
            EngineEvent::RunCompleted { record } => &record.task_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_on_the_wire() {
        let event = EngineEvent::TaskStatus {
            task_id: "t1".to_string(),
            status: TaskStatus::Running,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "task.status");
        assert_eq!(value["status"], "running");
        assert_eq!(event.task_id(), "t1");
    }
}
