use crate::models::config::EngineConfig;
use crate::models::config_validator::validate_config;
use crate::models::error::{BackupError, Result};
use crate::models::events::EngineEvent;
use crate::models::run_record::{LogFilter, RunRecord};
use crate::models::task::{Task, TaskDraft, TaskStatus, TaskUpdate};
use crate::repo::Database;
use crate::service::coordinator::{error_record, interrupted_record, run_task, RunContext};
use crate::service::registry::TaskRegistry;
use crate::service::scheduler::{spawn_scheduler, SchedulerHandle};
use crate::service::transfer::TransferDeps;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveRun {
    run_id: String,
    cancel: Arc<AtomicBool>,
}

struct EngineInner {
    config: EngineConfig,
    db: Database,
    registry: TaskRegistry,
    deps: TransferDeps,
    events: broadcast::Sender<EngineEvent>,
    pool: rayon::ThreadPool,
    active: Mutex<HashMap<String, ActiveRun>>,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl EngineInner {
    fn emit(&self, event: EngineEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn context(&self) -> RunContext<'_> {
        RunContext {
            config: &self.config,
            db: &self.db,
            registry: &self.registry,
            deps: &self.deps,
        }
    }
}

/// A run started by [`Engine::run_now`].
pub struct RunHandle {
    pub run_id: String,
    pub task_id: String,
    done: oneshot::Receiver<RunRecord>,
}

impl RunHandle {
    /// Block until the run has finished and return its record.
    ///
    /// # Panics
    ///
    /// Panics when called from inside an async runtime; use
    /// [`RunHandle::wait_async`] there.
    pub fn wait(self) -> Option<RunRecord> {
        self.done.blocking_recv().ok()
    }

    /// Wait for the run without blocking the calling task.
    pub async fn wait_async(self) -> Option<RunRecord> {
        self.done.await.ok()
    }
}

/// The backup engine: task registry, run coordinator and scheduler behind
/// one cheaply cloneable handle.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn open(config: EngineConfig) -> Result<Self> {
        let deps = TransferDeps::from_config(&config);
        Self::open_with(config, deps)
    }

    /// Open with custom transfer collaborators (space probe, FTP client,
    /// snapshot capture, password source).
    pub fn open_with(config: EngineConfig, deps: TransferDeps) -> Result<Self> {
        validate_config(&config)?;

        let db = Database::open(&config.database_file)?;
        let (registry, interrupted) = TaskRegistry::open(db.clone())?;
        let now = Utc::now();
        for task in &interrupted {
            let record = interrupted_record(task, &Uuid::new_v4().to_string(), now);
            db.insert_run_record(&record)?;
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_concurrent_runs)
            .thread_name(|i| format!("backup-run-{}", i))
            .build()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            "Engine ready: database {}, {} concurrent run(s)",
            config.database_file, config.max_concurrent_runs
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                db,
                registry,
                deps,
                events,
                pool,
                active: Mutex::new(HashMap::new()),
                scheduler: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        self.inner.registry.list()
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task> {
        self.inner.registry.get(task_id)
    }

    pub fn create_task(&self, draft: TaskDraft) -> Result<Task> {
        let task = self.inner.registry.create(draft, Utc::now())?;
        self.inner.emit(EngineEvent::TaskStatus {
            task_id: task.id.clone(),
            status: task.status,
        });
        Ok(task)
    }

    pub fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<Task> {
        self.inner.registry.update(task_id, update, Utc::now())
    }

    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        self.inner.registry.delete(task_id)
    }

    pub fn set_enabled(&self, task_id: &str, enabled: bool) -> Result<Task> {
        self.inner.registry.set_enabled(task_id, enabled, Utc::now())
    }

    /// Start a run of `task_id` on the worker pool. A task that is already
    /// running is rejected with `AlreadyRunning`, never queued.
    pub fn run_now(&self, task_id: &str) -> Result<RunHandle> {
        self.start_run(task_id, Utc::now())
    }

    fn start_run(&self, task_id: &str, now: DateTime<Utc>) -> Result<RunHandle> {
        let task = self.inner.registry.try_begin_run(task_id, now)?;
        let run_id = Uuid::new_v4().to_string();
        let cancel = Arc::new(AtomicBool::new(false));

        lock(&self.inner.active).insert(
            task.id.clone(),
            ActiveRun {
                run_id: run_id.clone(),
                cancel: Arc::clone(&cancel),
            },
        );
        self.inner.emit(EngineEvent::TaskStatus {
            task_id: task.id.clone(),
            status: TaskStatus::Running,
        });
        self.inner.emit(EngineEvent::RunStarted {
            task_id: task.id.clone(),
            run_id: run_id.clone(),
        });

        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let handle = RunHandle {
            run_id: run_id.clone(),
            task_id: task.id.clone(),
            done: rx,
        };

        self.inner.pool.spawn(move || {
            let ctx = inner.context();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                run_task(&ctx, &task, &run_id, now, &cancel)
            }));
            let (record, status) = outcome.unwrap_or_else(|_| {
                error!("Run {} of '{}' panicked", run_id, task.name);
                let failure = BackupError::Io(io::Error::other("run aborted unexpectedly"));
                let record = error_record(&task, &run_id, now, Duration::ZERO, &failure);
                if let Err(e) = inner.db.insert_run_record(&record) {
                    error!("Failed to append run record {}: {}", record.id, e);
                }
                if let Err(e) = inner.registry.finish_run(&task.id, TaskStatus::Error, now, Utc::now()) {
                    error!("Failed to settle task {}: {}", task.id, e);
                }
                (record, TaskStatus::Error)
            });

            {
                let mut active = lock(&inner.active);
                if active.get(&task.id).is_some_and(|run| run.run_id == run_id) {
                    active.remove(&task.id);
                }
            }
            inner.emit(EngineEvent::TaskStatus {
                task_id: task.id.clone(),
                status,
            });
            inner.emit(EngineEvent::RunCompleted {
                record: record.clone(),
            });
            let _ = tx.send(record);
        });

        debug!("Queued run {} of task {}", handle.run_id, handle.task_id);
        Ok(handle)
    }

    /// Ask the running execution of `task_id` to stop between files.
    /// Returns false when the task exists but is not running.
    pub fn cancel_run(&self, task_id: &str) -> Result<bool> {
        if let Some(run) = lock(&self.inner.active).get(task_id) {
            info!("Cancelling run {} of task {}", run.run_id, task_id);
            run.cancel.store(true, Ordering::SeqCst);
            return Ok(true);
        }
        self.inner.registry.get(task_id)?;
        Ok(false)
    }

    pub fn list_logs(&self, filter: &LogFilter) -> Result<Vec<RunRecord>> {
        self.inner.db.query_run_records(filter)
    }

    pub fn clear_logs(&self) -> Result<usize> {
        let removed = self.inner.db.delete_all_run_records()?;
        info!("Cleared {} run record(s)", removed);
        Ok(removed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Start every enabled task whose `next_run` has passed. Tasks still
    /// busy with an earlier run are skipped and rescheduled.
    pub fn run_due(&self, now: DateTime<Utc>) -> Vec<RunHandle> {
        let mut started = Vec::new();
        for task_id in self.inner.registry.due_tasks(now) {
            match self.start_run(&task_id, now) {
                Ok(handle) => started.push(handle),
                Err(BackupError::AlreadyRunning(name)) => {
                    warn!("Task '{}' is due but still running, skipping this slot", name);
                    if let Err(e) = self.inner.registry.reschedule(&task_id, now) {
                        error!("Failed to reschedule task {}: {}", task_id, e);
                    }
                }
                Err(e) => error!("Failed to start scheduled run of {}: {}", task_id, e),
            }
        }
        started
    }

    pub fn start_scheduler(&self) -> Result<()> {
        let mut scheduler = lock(&self.inner.scheduler);
        if scheduler.is_some() {
            return Ok(());
        }

        let engine = Arc::downgrade(&self.inner);
        let poll = Duration::from_secs(self.inner.config.scheduler_poll_secs);
        let handle = spawn_scheduler(poll, move |now| match engine.upgrade() {
            Some(inner) => {
                let started = Engine { inner }.run_due(now);
                if !started.is_empty() {
                    info!("Scheduler started {} run(s)", started.len());
                }
                true
            }
            None => false,
        })?;
        *scheduler = Some(handle);
        Ok(())
    }

    pub fn stop_scheduler(&self) {
        let handle = lock(&self.inner.scheduler).take();
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    /// Stop the scheduler, cancel running tasks and wait up to `grace` for
    /// them to settle.
    pub fn shutdown(&self, grace: Duration) {
        self.stop_scheduler();
        for run in lock(&self.inner.active).values() {
            run.cancel.store(true, Ordering::SeqCst);
        }

        let deadline = Instant::now() + grace;
        while !lock(&self.inner.active).is_empty() {
            if Instant::now() >= deadline {
                warn!("Shutting down with runs still in progress");
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        info!("Engine stopped");
    }
}
