use crate::models::config_validator::validate_task;
use crate::models::error::{BackupError, Result};
use crate::models::task::{Task, TaskDraft, TaskStatus, TaskUpdate};
use crate::repo::Database;
use crate::service::scheduler::next_run;
use chrono::{DateTime, Local, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use uuid::Uuid;

type TaskSlot = Arc<Mutex<Task>>;

fn lock(slot: &TaskSlot) -> MutexGuard<'_, Task> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Next scheduled run of `task` after `now`, evaluated in local time.
pub fn compute_next_run(task: &Task, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !task.enabled {
        return None;
    }
    next_run(&task.schedule, &now.with_timezone(&Local)).map(|t| t.with_timezone(&Utc))
}

/// Owns task definitions and their status. Every mutation is written
/// through to the database while the task's own lock is held, so writers
/// of different tasks never wait on each other.
///
/// Lock order: a task's mutex may be held while taking the map lock, never
/// the other way round.
pub struct TaskRegistry {
    db: Database,
    tasks: RwLock<HashMap<String, TaskSlot>>,
}

impl TaskRegistry {
    /// Load persisted tasks. Tasks left `running` by a previous process
    /// are reset to `error` and returned so the caller can log them.
    pub fn open(db: Database) -> Result<(Self, Vec<Task>)> {
        let mut tasks = HashMap::new();
        let mut interrupted = Vec::new();

        for mut task in db.load_tasks()? {
            if task.status == TaskStatus::Running {
                warn!("Task '{}' was running when the engine stopped", task.name);
                task.status = TaskStatus::Error;
                db.save_task(&task)?;
                interrupted.push(task.clone());
            }
            tasks.insert(task.id.clone(), Arc::new(Mutex::new(task)));
        }
        info!("Loaded {} task(s)", tasks.len());

        Ok((
            Self {
                db,
                tasks: RwLock::new(tasks),
            },
            interrupted,
        ))
    }

    fn slot(&self, task_id: &str) -> Result<TaskSlot> {
        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
        tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| BackupError::TaskNotFound(task_id.to_string()))
    }

    /// Lock `slot`, failing when the task was deleted while this caller
    /// waited for it. Every write-through goes through here so a deleted
    /// task is never saved back.
    fn lock_live<'a>(&self, task_id: &str, slot: &'a TaskSlot) -> Result<MutexGuard<'a, Task>> {
        let guard = lock(slot);
        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
        match tasks.get(task_id) {
            Some(live) if Arc::ptr_eq(live, slot) => Ok(guard),
            _ => Err(BackupError::TaskNotFound(task_id.to_string())),
        }
    }

    fn slots(&self) -> Vec<TaskSlot> {
        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
        tasks.values().cloned().collect()
    }

    /// All tasks, sorted by name.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.slots().iter().map(|slot| lock(slot).clone()).collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub fn get(&self, task_id: &str) -> Result<Task> {
        Ok(lock(&self.slot(task_id)?).clone())
    }

    pub fn create(&self, draft: TaskDraft, now: DateTime<Utc>) -> Result<Task> {
        let mut task = draft.into_task(Uuid::new_v4().to_string());
        validate_task(&task)?;
        task.next_run = compute_next_run(&task, now);

        self.db.save_task(&task)?;
        let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
        tasks.insert(task.id.clone(), Arc::new(Mutex::new(task.clone())));
        info!("Created task '{}' ({})", task.name, task.id);
        Ok(task)
    }

    /// Apply `update`, validating the merged task before it replaces the
    /// stored one. A run in progress keeps the definition it started with.
    pub fn update(&self, task_id: &str, update: &TaskUpdate, now: DateTime<Utc>) -> Result<Task> {
        let slot = self.slot(task_id)?;
        let mut current = self.lock_live(task_id, &slot)?;

        let mut merged = update.apply(&current);
        validate_task(&merged)?;
        merged.next_run = compute_next_run(&merged, now);

        self.db.save_task(&merged)?;
        *current = merged.clone();
        debug!("Updated task {}", task_id);
        Ok(merged)
    }

    pub fn set_enabled(&self, task_id: &str, enabled: bool, now: DateTime<Utc>) -> Result<Task> {
        let update = TaskUpdate {
            enabled: Some(enabled),
            ..TaskUpdate::default()
        };
        self.update(task_id, &update, now)
    }

    /// Remove a task. Rejected while it is running.
    pub fn delete(&self, task_id: &str) -> Result<()> {
        let slot = self.slot(task_id)?;
        let current = self.lock_live(task_id, &slot)?;
        if current.status == TaskStatus::Running {
            return Err(BackupError::AlreadyRunning(current.name.clone()));
        }

        self.db.delete_task(task_id)?;
        let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
        tasks.remove(task_id);
        info!("Deleted task '{}' ({})", current.name, task_id);
        Ok(())
    }

    /// Atomically move a task to `running` and return the definition the
    /// run should use. Fails with `AlreadyRunning` instead of queueing.
    pub fn try_begin_run(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task> {
        let slot = self.slot(task_id)?;
        let mut current = self.lock_live(task_id, &slot)?;
        if current.status == TaskStatus::Running {
            return Err(BackupError::AlreadyRunning(current.name.clone()));
        }

        let mut running = current.clone();
        running.status = TaskStatus::Running;
        running.next_run = compute_next_run(&running, now);
        self.db.save_task(&running)?;
        *current = running.clone();
        Ok(running)
    }

    /// Settle a task after its run. `next_run` is only recomputed when it
    /// has already passed.
    pub fn finish_run(
        &self,
        task_id: &str,
        status: TaskStatus,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let slot = self.slot(task_id)?;
        let mut current = self.lock_live(task_id, &slot)?;

        let mut settled = current.clone();
        settled.status = status;
        settled.last_run = Some(started_at);
        if settled.next_run.map_or(true, |next| next <= now) {
            settled.next_run = compute_next_run(&settled, now);
        }
        self.db.save_task(&settled)?;
        *current = settled.clone();
        Ok(settled)
    }

    /// Push `next_run` past `now` without running, used when a due task is
    /// still busy with an earlier run.
    pub fn reschedule(&self, task_id: &str, now: DateTime<Utc>) -> Result<()> {
        let slot = self.slot(task_id)?;
        let mut current = self.lock_live(task_id, &slot)?;
        let mut rescheduled = current.clone();
        rescheduled.next_run = compute_next_run(&rescheduled, now);
        self.db.save_task(&rescheduled)?;
        *current = rescheduled;
        Ok(())
    }

    /// Ids of enabled tasks whose `next_run` is at or before `now`.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<(DateTime<Utc>, String)> = self
            .slots()
            .iter()
            .filter_map(|slot| {
                let task = lock(slot);
                match task.next_run {
                    Some(next) if task.enabled && next <= now => Some((next, task.id.clone())),
                    _ => None,
                }
            })
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }
}
