use crate::models::config::EngineConfig;
use crate::models::error::{BackupError, FailureKind, Result};
use crate::models::run_record::{FileIssue, RunRecord, RunStatus};
use crate::models::snapshot::SnapshotKind;
use crate::models::task::{BackupType, Task, TaskStatus};
use crate::repo::Database;
use crate::service::change_detector::{detect_changes, CandidateFile, ChangeSet};
use crate::service::registry::TaskRegistry;
use crate::service::transfer::{open_sink, skipped_for, transfer, TransferDeps, TransferJob, TransferResult};
use crate::utils::format::{format_bytes, format_duration};
use chrono::{DateTime, Local, Utc};
use log::{error, info, warn};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Shared collaborators of every run.
pub struct RunContext<'a> {
    pub config: &'a EngineConfig,
    pub db: &'a Database,
    pub registry: &'a TaskRegistry,
    pub deps: &'a TransferDeps,
}

/// Task status a run settles to.
pub fn settled_status(status: RunStatus) -> TaskStatus {
    match status {
        RunStatus::Success | RunStatus::Warning => TaskStatus::Success,
        RunStatus::Error => TaskStatus::Error,
        RunStatus::Cancelled => TaskStatus::Idle,
    }
}

/// Run `task` end to end: execute, append the run record and settle the
/// task status in the registry. The task must already be `running`.
pub fn run_task(
    ctx: &RunContext<'_>,
    task: &Task,
    run_id: &str,
    started_at: DateTime<Utc>,
    cancel: &Arc<AtomicBool>,
) -> (RunRecord, TaskStatus) {
    let record = execute_run(ctx, task, run_id, started_at, cancel);

    if let Err(e) = ctx.db.insert_run_record(&record) {
        error!("Failed to append run record {}: {}", record.id, e);
    }

    let status = settled_status(record.status);
    if let Err(e) = ctx.registry.finish_run(&task.id, status, started_at, Utc::now()) {
        error!("Failed to settle task {}: {}", task.id, e);
    }

    info!(
        "Run {} of '{}' finished: {} ({})",
        run_id,
        task.name,
        record.status.as_str(),
        record.message
    );
    (record, status)
}

fn base_record(task: &Task, run_id: &str, started_at: DateTime<Utc>, backup_type: BackupType) -> RunRecord {
    RunRecord {
        id: run_id.to_string(),
        task_id: task.id.clone(),
        task_name: task.name.clone(),
        timestamp: started_at,
        status: RunStatus::Error,
        message: String::new(),
        backup_type,
        files_processed: 0,
        files_skipped: 0,
        files_failed: 0,
        files_removed: 0,
        destinations_failed: 0,
        total_bytes: 0,
        duration_ms: 0,
        size: format_bytes(0),
        duration: String::new(),
        failures: Vec::new(),
    }
}

fn set_duration(record: &mut RunRecord, elapsed: Duration) {
    record.duration_ms = elapsed.as_millis() as u64;
    record.duration = format_duration(elapsed);
}

/// Record for a run that could not get as far as transferring anything.
pub fn error_record(
    task: &Task,
    run_id: &str,
    started_at: DateTime<Utc>,
    elapsed: Duration,
    error: &BackupError,
) -> RunRecord {
    let mut record = base_record(task, run_id, started_at, task.backup_type);
    record.message = format!("Backup failed: {}", error);
    record.failures.push(FileIssue {
        path: String::new(),
        destination: None,
        kind: error.kind(),
        reason: error.to_string(),
    });
    set_duration(&mut record, elapsed);
    record
}

/// Record appended for a run the previous engine process never finished.
pub fn interrupted_record(task: &Task, run_id: &str, now: DateTime<Utc>) -> RunRecord {
    let mut record = base_record(task, run_id, now, task.backup_type);
    record.message = "Run interrupted by engine restart".to_string();
    record.failures.push(FileIssue {
        path: String::new(),
        destination: None,
        kind: FailureKind::Internal,
        reason: "interrupted by engine restart".to_string(),
    });
    set_duration(&mut record, Duration::ZERO);
    record
}

/// Execute one run. Never fails: every outcome, including total failure,
/// is described by the returned record.
pub fn execute_run(
    ctx: &RunContext<'_>,
    task: &Task,
    run_id: &str,
    started_at: DateTime<Utc>,
    cancel: &Arc<AtomicBool>,
) -> RunRecord {
    let started = Instant::now();
    info!("Starting {} run {} of '{}'", task.backup_type, run_id, task.name);

    match prepare_and_transfer(ctx, task, run_id, started_at, cancel, started) {
        Ok(record) => record,
        Err(e) => {
            error!("Run {} of '{}' failed: {}", run_id, task.name, e);
            error_record(task, run_id, started_at, started.elapsed(), &e)
        }
    }
}

fn prepare_and_transfer(
    ctx: &RunContext<'_>,
    task: &Task,
    run_id: &str,
    started_at: DateTime<Utc>,
    cancel: &Arc<AtomicBool>,
    started: Instant,
) -> Result<RunRecord> {
    let latest = ctx.db.load_snapshot(&task.id, SnapshotKind::Latest)?;
    let anchor = ctx.db.load_snapshot(&task.id, SnapshotKind::Anchor)?;
    let change = detect_changes(task, latest.as_ref(), anchor.as_ref(), ctx.config.always_hash)?;

    let password = if task.options.encryption {
        Some(ctx.deps.passwords.password()?)
    } else {
        None
    };

    fs::create_dir_all(&ctx.config.staging_dir)?;
    let staging = TempDir::with_prefix_in(format!("run-{}-", run_id), &ctx.config.staging_dir)?;

    let (ready, capture_skipped) = if task.options.use_vss {
        capture_files(ctx, &change.to_copy, staging.path())
    } else {
        (change.to_copy.clone(), Vec::new())
    };

    let stamp = started_at.with_timezone(&Local).format("%Y%m%d-%H%M%S").to_string();
    let job = TransferJob::new(
        task,
        &ready,
        password.as_deref(),
        &stamp,
        staging.path(),
        ctx.config.integrity_retries,
        cancel,
    );
    let results = transfer_all(ctx, task, &job, cancel);

    let mut outcome = RunOutcome::collect(&change, &ready, capture_skipped, &results);
    let cancelled = cancel.load(Ordering::SeqCst);
    let status = outcome.status(cancelled, &change, &ready, results.len());

    let save_latest = status != RunStatus::Error || !outcome.delivered.is_empty() || change.to_copy.is_empty();
    if save_latest {
        let next = change.next_snapshot(&outcome.delivered, latest.as_ref());
        let save_anchor = change.effective_type == BackupType::Full && !cancelled;
        if let Err(e) = ctx
            .db
            .save_snapshots(&task.id, &next, save_anchor.then_some(&next))
        {
            error!("Failed to save snapshot for '{}': {}", task.name, e);
            outcome.failures.push(skipped_for(FailureKind::Internal, "", e.to_string()));
        }
    } else {
        warn!("Nothing reached any destination, keeping the previous snapshot of '{}'", task.name);
    }

    // A snapshot that could not be written turns a clean run into a warning.
    let status = match status {
        RunStatus::Success if !outcome.failures.is_empty() => RunStatus::Warning,
        other => other,
    };

    let mut record = base_record(task, run_id, started_at, change.effective_type);
    record.status = status;
    record.files_processed = outcome.delivered.len() as u64;
    record.files_failed = outcome.files_failed;
    record.files_skipped = outcome.files_skipped;
    record.files_removed = change.removed.len() as u64;
    record.destinations_failed = outcome.destinations_failed as u32;
    record.total_bytes = outcome.total_bytes;
    record.size = format_bytes(outcome.total_bytes);
    record.message = outcome.message(status, &change, results.len());
    outcome.failures.truncate(ctx.config.max_logged_failures);
    record.failures = outcome.failures;
    set_duration(&mut record, started.elapsed());
    Ok(record)
}

/// Take point-in-time copies of the files to transfer. Files that cannot
/// be captured are dropped from the run with a warning.
fn capture_files(
    ctx: &RunContext<'_>,
    files: &[CandidateFile],
    staging: &Path,
) -> (Vec<CandidateFile>, Vec<FileIssue>) {
    let mut ready = Vec::with_capacity(files.len());
    let mut skipped = Vec::new();
    for (index, file) in files.iter().enumerate() {
        let name = format!("capture/{}/{}", index, file.key());
        match ctx.deps.capture.capture(&file.path, staging, &name) {
            Ok(path) => ready.push(CandidateFile {
                path,
                entry: file.entry.clone(),
            }),
            Err(e) => {
                warn!("Could not capture {}: {}", file.path.display(), e);
                skipped.push(skipped_for(
                    FailureKind::SourceUnavailable,
                    file.key(),
                    format!("snapshot capture failed: {}", e),
                ));
            }
        }
    }
    (ready, skipped)
}

/// Drive every destination on its own thread so a slow one does not hold
/// up the others.
fn transfer_all(
    ctx: &RunContext<'_>,
    task: &Task,
    job: &TransferJob<'_>,
    cancel: &Arc<AtomicBool>,
) -> Vec<TransferResult> {
    thread::scope(|scope| {
        let handles: Vec<_> = task
            .destinations
            .iter()
            .map(|destination| {
                let handle = scope.spawn(move || {
                    let mut sink = open_sink(destination, ctx.deps, ctx.config, Arc::clone(cancel));
                    transfer(job, &destination.id, sink.as_mut())
                });
                (destination, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(destination, handle)| {
                handle.join().unwrap_or_else(|_| {
                    error!("Transfer to {} panicked", destination.label());
                    TransferResult {
                        destination_id: destination.id.clone(),
                        succeeded: Vec::new(),
                        skipped: Vec::new(),
                        failed: Vec::new(),
                        bytes_written: 0,
                        duration: Duration::ZERO,
                        fatal: Some(FileIssue {
                            path: destination.id.clone(),
                            destination: Some(destination.id.clone()),
                            kind: FailureKind::Internal,
                            reason: "transfer thread panicked".to_string(),
                        }),
                    }
                })
            })
            .collect()
    })
}

/// Per-run totals across all destinations.
struct RunOutcome {
    delivered: HashSet<String>,
    files_failed: u64,
    files_skipped: u64,
    destinations_failed: usize,
    total_bytes: u64,
    failures: Vec<FileIssue>,
}

impl RunOutcome {
    fn collect(
        change: &ChangeSet,
        ready: &[CandidateFile],
        capture_skipped: Vec<FileIssue>,
        results: &[TransferResult],
    ) -> Self {
        let delivered: HashSet<String> = results
            .iter()
            .flat_map(|r| r.succeeded.iter().cloned())
            .collect();
        let destinations_failed = results.iter().filter(|r| r.is_fatal()).count();
        let failed_somewhere: HashSet<&str> = results
            .iter()
            .flat_map(|r| r.failed.iter().map(|i| i.path.as_str()))
            .collect();

        let mut files_failed = 0;
        let mut files_skipped = (change.skipped.len() + capture_skipped.len()) as u64;
        let mut total_bytes = 0;
        for file in ready {
            if delivered.contains(file.key()) {
                total_bytes += file.entry.size;
            } else if destinations_failed > 0 || failed_somewhere.contains(file.key()) {
                files_failed += 1;
            } else {
                files_skipped += 1;
            }
        }

        let mut failures = Vec::new();
        for result in results {
            failures.extend(result.fatal.iter().cloned());
            failures.extend(result.failed.iter().cloned());
        }
        failures.extend(change.skipped.iter().cloned());
        failures.extend(capture_skipped);
        for result in results {
            failures.extend(result.skipped.iter().cloned());
        }

        Self {
            delivered,
            files_failed,
            files_skipped,
            destinations_failed,
            total_bytes,
            failures,
        }
    }

    fn status(&self, cancelled: bool, change: &ChangeSet, ready: &[CandidateFile], destinations: usize) -> RunStatus {
        if cancelled {
            RunStatus::Cancelled
        } else if destinations > 0 && self.destinations_failed == destinations {
            RunStatus::Error
        } else if !change.to_copy.is_empty() && !ready.is_empty() && self.delivered.is_empty() && self.files_failed > 0 {
            RunStatus::Error
        } else if self.files_failed > 0 || self.files_skipped > 0 || self.destinations_failed > 0 {
            RunStatus::Warning
        } else {
            RunStatus::Success
        }
    }

    fn message(&self, status: RunStatus, change: &ChangeSet, destinations: usize) -> String {
        let mut message = String::new();
        if change.fell_back_to_full {
            message.push_str("No previous snapshot, ran a full backup. ");
        }
        let copied = format!(
            "{} file(s), {}",
            self.delivered.len(),
            format_bytes(self.total_bytes)
        );
        let body = match status {
            RunStatus::Success if change.to_copy.is_empty() => "Nothing changed since the last run".to_string(),
            RunStatus::Success => format!("Backed up {} to {} destination(s)", copied, destinations),
            RunStatus::Warning => format!(
                "Backed up {} with problems: {} failed, {} skipped, {} of {} destination(s) failed",
                copied, self.files_failed, self.files_skipped, self.destinations_failed, destinations
            ),
            RunStatus::Error => match self.failures.first() {
                Some(first) => format!("Backup failed: {}", first.reason),
                None => "Backup failed".to_string(),
            },
            RunStatus::Cancelled => format!("Cancelled after {}", copied),
        };
        message.push_str(&body);
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::destination::{Destination, FtpTarget};
    use crate::models::run_record::LogFilter;
    use crate::models::task::TaskDraft;
    use crate::service::transfer::capture::SnapshotCapture;
    use crate::service::transfer::codec::FixedPassword;
    use crate::service::transfer::ftp::fake::{FakeConnector, FakeFtp};
    use crate::service::transfer::local::SpaceProbe;
    use std::path::PathBuf;

    struct NoProbe;

    impl SpaceProbe for NoProbe {
        fn available_space(&self, _path: &Path) -> Option<u64> {
            None
        }
    }

    struct BrokenCapture;

    impl SnapshotCapture for BrokenCapture {
        fn capture(&self, source: &Path, _staging: &Path, _name: &str) -> Result<PathBuf> {
            Err(BackupError::SourceUnavailable {
                path: source.to_path_buf(),
                reason: "no volume snapshot service".to_string(),
            })
        }
    }

    struct Fixture {
        source: TempDir,
        target: TempDir,
        _staging: TempDir,
        config: EngineConfig,
        db: Database,
        registry: TaskRegistry,
        deps: TransferDeps,
    }

    impl Fixture {
        fn new() -> Self {
            let staging = TempDir::new().unwrap();
            let mut config = EngineConfig::with_database(":memory:");
            config.staging_dir = staging.path().to_path_buf();
            let db = Database::open(":memory:").unwrap();
            let registry = TaskRegistry::open(db.clone()).unwrap().0;
            let deps = TransferDeps {
                space: Arc::new(NoProbe),
                passwords: Arc::new(FixedPassword("pw".to_string())),
                ..TransferDeps::from_config(&config)
            };
            Self {
                source: TempDir::new().unwrap(),
                target: TempDir::new().unwrap(),
                _staging: staging,
                config,
                db,
                registry,
                deps,
            }
        }

        fn docs(&self) -> PathBuf {
            self.source.path().join("docs")
        }

        fn write(&self, name: &str, content: &[u8]) {
            fs::create_dir_all(self.docs()).unwrap();
            fs::write(self.docs().join(name), content).unwrap();
        }

        fn task(&self, configure: impl FnOnce(&mut TaskDraft)) -> Task {
            let mut draft = TaskDraft {
                name: "Docs".to_string(),
                sources: vec![self.docs()],
                destinations: vec![Destination::local("d1", self.target.path())],
                ..TaskDraft::default()
            };
            configure(&mut draft);
            self.registry.create(draft, Utc::now()).unwrap()
        }

        fn run(&self, task: &Task) -> (RunRecord, TaskStatus) {
            self.run_with(task, Arc::new(AtomicBool::new(false)))
        }

        fn run_with(&self, task: &Task, cancel: Arc<AtomicBool>) -> (RunRecord, TaskStatus) {
            let ctx = RunContext {
                config: &self.config,
                db: &self.db,
                registry: &self.registry,
                deps: &self.deps,
            };
            let running = self.registry.try_begin_run(&task.id, Utc::now()).unwrap();
            run_task(&ctx, &running, &uuid::Uuid::new_v4().to_string(), Utc::now(), &cancel)
        }

        fn latest(&self, task: &Task) -> Option<crate::models::snapshot::Snapshot> {
            self.db.load_snapshot(&task.id, SnapshotKind::Latest).unwrap()
        }
    }

    fn unreachable_ftp() -> Destination {
        Destination::ftp(
            "d2",
            FtpTarget {
                host: "192.168.1.100".to_string(),
                port: 21,
                username: "backup".to_string(),
                password: "wrong".to_string(),
                path: "/backup".to_string(),
                passive: true,
            },
        )
    }

    #[test]
    fn test_incremental_copies_modified_and_added_files() {
        let fx = Fixture::new();
        fx.write("a.txt", b"alpha");
        let task = fx.task(|_| {});

        let (first, _) = fx.run(&task);
        assert_eq!(first.status, RunStatus::Success);
        assert_eq!(first.backup_type, BackupType::Full);
        let h1 = fx.latest(&task).unwrap().get("docs/a.txt").unwrap().hash.clone();

        fx.write("a.txt", b"alpha, second edition");
        fx.write("b.txt", b"bravo");
        let (second, status) = fx.run(&task);

        assert_eq!(second.status, RunStatus::Success);
        assert_eq!(second.backup_type, BackupType::Incremental);
        assert_eq!(second.files_processed, 2);
        assert_eq!(status, TaskStatus::Success);

        let latest = fx.latest(&task).unwrap();
        assert_eq!(latest.len(), 2);
        assert_ne!(latest.get("docs/a.txt").unwrap().hash, h1);
        assert!(latest.get("docs/b.txt").is_some());

        let (third, _) = fx.run(&task);
        assert_eq!(third.files_processed, 0);
        assert_eq!(third.status, RunStatus::Success);

        let logs = fx.db.query_run_records(&LogFilter::for_task(&task.id)).unwrap();
        assert_eq!(logs.len(), 3);
        let settled = fx.registry.get(&task.id).unwrap();
        assert_eq!(settled.status, TaskStatus::Success);
        assert!(settled.last_run.is_some());
    }

    #[test]
    fn test_differential_always_diffs_against_full_anchor() {
        let fx = Fixture::new();
        fx.write("a.txt", b"alpha");
        fx.write("b.txt", b"bravo");
        let task = fx.task(|d| d.backup_type = BackupType::Differential);

        let (first, _) = fx.run(&task);
        assert_eq!(first.backup_type, BackupType::Full);
        assert!(first.message.contains("full backup"));

        fx.write("a.txt", b"alpha changed");
        let (second, _) = fx.run(&task);
        assert_eq!(second.backup_type, BackupType::Differential);
        assert_eq!(second.files_processed, 1);

        fx.write("b.txt", b"bravo changed");
        let (third, _) = fx.run(&task);
        assert_eq!(third.files_processed, 2);
    }

    #[test]
    fn test_excluded_files_are_never_copied() {
        let fx = Fixture::new();
        fx.write("a.txt", b"alpha");
        fx.write("scratch.tmp", b"junk");
        let task = fx.task(|d| {
            d.backup_type = BackupType::Full;
            d.exclude_patterns = vec!["*.tmp".to_string()];
        });

        let (record, _) = fx.run(&task);
        assert_eq!(record.files_processed, 1);
        assert!(fx.latest(&task).unwrap().get("docs/scratch.tmp").is_none());
    }

    #[test]
    fn test_one_unreachable_destination_is_a_warning() {
        let mut fx = Fixture::new();
        let server = Arc::new(FakeFtp {
            refuse_login: true,
            ..FakeFtp::default()
        });
        fx.deps.ftp = Arc::new(FakeConnector(server));
        fx.write("a.txt", b"alpha");
        let target = fx.target.path().to_path_buf();
        let task = fx.task(|d| {
            d.destinations = vec![Destination::local("d1", &target), unreachable_ftp()];
        });

        let (record, status) = fx.run(&task);
        assert_eq!(record.status, RunStatus::Warning);
        assert_eq!(status, TaskStatus::Success);
        assert_eq!(record.destinations_failed, 1);
        assert_eq!(record.files_processed, 1);
        assert_eq!(record.failures[0].kind, FailureKind::DestinationUnreachable);
        assert!(fx.latest(&task).unwrap().get("docs/a.txt").is_some());
    }

    #[test]
    fn test_stalled_destination_does_not_hold_up_the_others() {
        let mut fx = Fixture::new();
        let (release, gate) = std::sync::mpsc::channel();
        let server = Arc::new(FakeFtp {
            connect_gate: std::sync::Mutex::new(Some(gate)),
            ..FakeFtp::default()
        });
        fx.deps.ftp = Arc::new(FakeConnector(Arc::clone(&server)));
        fx.write("a.txt", b"alpha");
        let target = fx.target.path().to_path_buf();
        let task = fx.task(|d| {
            d.backup_type = BackupType::Full;
            d.options.compression = false;
            d.options.create_versioned_backups = false;
            d.destinations = vec![Destination::local("d1", &target), unreachable_ftp()];
        });

        let local_copy = target.join("docs").join("a.txt");
        let record = std::thread::scope(|scope| {
            let run = scope.spawn(|| fx.run(&task).0);

            let deadline = Instant::now() + Duration::from_secs(10);
            while !local_copy.exists() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            assert!(local_copy.exists());
            assert!(!run.is_finished());

            release.send(()).unwrap();
            run.join().unwrap()
        });

        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.files_processed, 1);
        assert_eq!(fs::read(&local_copy).unwrap(), b"alpha");
        assert_eq!(server.file("/backup/docs/a.txt").unwrap(), b"alpha");
    }

    #[test]
    fn test_all_destinations_unreachable_is_an_error() {
        let mut fx = Fixture::new();
        fx.deps.ftp = Arc::new(FakeConnector(Arc::new(FakeFtp {
            refuse_login: true,
            ..FakeFtp::default()
        })));
        fx.write("a.txt", b"alpha");
        let task = fx.task(|d| d.destinations = vec![unreachable_ftp()]);

        let (record, status) = fx.run(&task);
        assert_eq!(record.status, RunStatus::Error);
        assert_eq!(status, TaskStatus::Error);
        assert_eq!(record.files_failed, 1);
        assert!(fx.latest(&task).is_none());

        let logs = fx.db.query_run_records(&LogFilter::for_task(&task.id)).unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[test]
    fn test_missing_sources_produce_error_record() {
        let fx = Fixture::new();
        fx.write("a.txt", b"alpha");
        let task = fx.task(|_| {});
        fs::remove_dir_all(fx.docs()).unwrap();

        let (record, status) = fx.run(&task);
        assert_eq!(record.status, RunStatus::Error);
        assert_eq!(status, TaskStatus::Error);
        assert_eq!(record.failures[0].kind, FailureKind::SourceUnavailable);
    }

    #[test]
    fn test_encryption_without_password_fails_the_run() {
        let mut fx = Fixture::new();
        fx.deps.passwords = Arc::new(crate::service::transfer::codec::EnvPasswordSource::new(
            "RBE_COORDINATOR_TEST_UNSET",
        ));
        fx.write("a.txt", b"alpha");
        let task = fx.task(|d| d.options.encryption = true);

        let (record, _) = fx.run(&task);
        assert_eq!(record.status, RunStatus::Error);
        assert!(record.message.contains("RBE_COORDINATOR_TEST_UNSET"));
    }

    #[test]
    fn test_failed_capture_skips_file_with_warning() {
        let mut fx = Fixture::new();
        fx.deps.capture = Arc::new(BrokenCapture);
        fx.write("a.txt", b"alpha");
        let task = fx.task(|d| d.options.use_vss = true);

        let (record, status) = fx.run(&task);
        assert_eq!(record.status, RunStatus::Warning);
        assert_eq!(status, TaskStatus::Success);
        assert_eq!(record.files_processed, 0);
        assert_eq!(record.files_skipped, 1);
        assert!(fx.latest(&task).unwrap().get("docs/a.txt").is_none());
    }

    #[test]
    fn test_cancelled_run_is_marked_cancelled() {
        let fx = Fixture::new();
        fx.write("a.txt", b"alpha");
        let task = fx.task(|d| d.options.archive_per_run = false);

        let (record, status) = fx.run_with(&task, Arc::new(AtomicBool::new(true)));
        assert_eq!(record.status, RunStatus::Cancelled);
        assert_eq!(status, TaskStatus::Idle);
        assert_eq!(record.files_processed, 0);
        assert_eq!(fx.registry.get(&task.id).unwrap().status, TaskStatus::Idle);
    }

    #[test]
    fn test_failures_are_capped() {
        let mut fx = Fixture::new();
        fx.config.max_logged_failures = 2;
        fx.deps.capture = Arc::new(BrokenCapture);
        for i in 0..5 {
            fx.write(&format!("f{}.txt", i), b"x");
        }
        let task = fx.task(|d| d.options.use_vss = true);

        let (record, _) = fx.run(&task);
        assert_eq!(record.files_skipped, 5);
        assert_eq!(record.failures.len(), 2);
    }
}
