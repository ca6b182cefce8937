use crate::models::error::Result;
use crate::models::schedule::{Frequency, Schedule};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use log::{debug, info, warn};
use std::str::FromStr;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Next time `schedule` fires strictly after `from`, in `from`'s time zone.
/// Manual schedules never fire.
pub fn next_run<Tz: TimeZone>(schedule: &Schedule, from: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let expression = match schedule.frequency {
        Frequency::Manual => return None,
        Frequency::Hourly => "0 0 * * * *".to_string(),
        Frequency::Daily => {
            let time = schedule.time_of_day()?;
            format!("0 {} {} * * *", time.minute(), time.hour())
        }
        Frequency::Weekly => {
            let time = schedule.time_of_day()?;
            let mut days: Vec<u8> = schedule.days.iter().copied().filter(|d| *d < 7).collect();
            days.sort_unstable();
            days.dedup();
            if days.is_empty() {
                return None;
            }
            let names: Vec<&str> = days.iter().map(|d| WEEKDAYS[*d as usize]).collect();
            format!("0 {} {} * * {}", time.minute(), time.hour(), names.join(","))
        }
        Frequency::Monthly => {
            let time = schedule.time_of_day()?;
            let day = schedule.day_of_month?;
            return next_monthly(day, time, from);
        }
    };

    match cron::Schedule::from_str(&expression) {
        Ok(cron_schedule) => cron_schedule.after(from).next(),
        Err(e) => {
            warn!("Invalid cron expression '{}': {}", expression, e);
            None
        }
    }
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn next_monthly<Tz: TimeZone>(day: u32, time: NaiveTime, from: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let tz = from.timezone();
    let local = from.naive_local();
    let (mut year, mut month) = (local.year(), local.month());

    for _ in 0..48 {
        let clamped = day.clamp(1, last_day_of_month(year, month));
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, clamped) {
            if let Some(candidate) = tz.from_local_datetime(&date.and_time(time)).earliest() {
                if candidate > *from {
                    return Some(candidate);
                }
            }
        }
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    None
}

/// Background thread that calls `tick` once per poll interval until stopped.
pub struct SchedulerHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            // The last engine reference can be released by the scheduler
            // thread itself; joining there would wait forever.
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start the scheduler loop. `tick` receives the current time and returns
/// false when the loop should end on its own.
pub fn spawn_scheduler<F>(poll: Duration, tick: F) -> Result<SchedulerHandle>
where
    F: Fn(DateTime<Utc>) -> bool + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<()>();
    let thread = thread::Builder::new()
        .name("backup-scheduler".to_string())
        .spawn(move || {
            info!("Scheduler started, polling every {}s", poll.as_secs());
            loop {
                if !tick(Utc::now()) {
                    break;
                }
                match rx.recv_timeout(poll) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("Scheduler stopped");
        })?;
    debug!("Scheduler thread spawned");

    Ok(SchedulerHandle {
        stop: Some(tx),
        thread: Some(thread),
    })
}
