use crate::models::config::EngineConfig;
use crate::models::destination::Target;
use crate::models::error::{BackupError, Result};
use crate::models::schedule::{Frequency, Schedule};
use crate::models::task::Task;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Validates the engine configuration, reporting every problem at once.
pub fn validate_config(config: &EngineConfig) -> Result<()> {
    info!("Validating configuration...");

    let mut problems = Vec::new();
    validate_numeric_values(config, &mut problems);
    if let Err(e) = validate_database_path(&config.database_file) {
        problems.push(e);
    }

    if config.encryption_password_env.trim().is_empty() {
        problems.push("encryption_password_env must name an environment variable".to_string());
    }

    finish("Configuration", problems)?;
    info!("Configuration validation passed");
    Ok(())
}

fn finish(subject: &str, problems: Vec<String>) -> Result<()> {
    if problems.is_empty() {
        return Ok(());
    }
    for problem in &problems {
        debug!("{} problem: {}", subject, problem);
    }
    Err(BackupError::Config(problems.join("; ")))
}

fn validate_numeric_values(config: &EngineConfig, problems: &mut Vec<String>) {
    if config.max_concurrent_runs == 0 {
        problems.push("max_concurrent_runs must be greater than 0".to_string());
    }

    if config.scheduler_poll_secs == 0 {
        problems.push("scheduler_poll_secs must be greater than 0".to_string());
    }

    if config.ftp.max_attempts == 0 {
        problems.push("ftp.max_attempts must be greater than 0".to_string());
    }

    if config.ftp.connect_timeout_secs == 0 || config.ftp.operation_timeout_secs == 0 {
        problems.push("ftp timeouts must be greater than 0".to_string());
    }

    let cpu_count = num_cpus::get_physical();
    if config.max_concurrent_runs > cpu_count * 4 {
        warn!(
            "max_concurrent_runs ({}) is more than 4x the number of physical CPUs ({}).",
            config.max_concurrent_runs, cpu_count
        );
    }
}

fn validate_database_path(db_file: &str) -> std::result::Result<(), String> {
    if db_file.is_empty() {
        return Err("database_file cannot be empty. Provide a path or ':memory:'".to_string());
    }

    if db_file == ":memory:" || db_file.starts_with("file::memory:") {
        info!("Using in-memory database; state will not survive a restart");
        return Ok(());
    }

    let path = Path::new(db_file);

    if path.exists() {
        if !path.is_file() {
            return Err(format!("Database path exists but is not a file: {}", db_file));
        }
        return Ok(());
    }

    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Ok(()),
        Some(parent) if !parent.exists() => {
            #[cfg(windows)]
            let suggestion = format!("mkdir \"{}\"", parent.display());
            #[cfg(not(windows))]
            let suggestion = format!("mkdir -p \"{}\"", parent.display());

            Err(format!(
                "Database parent directory does not exist: {}\nSuggestion: Create the directory with: {}",
                db_file, suggestion
            ))
        }
        Some(parent) => check_writable(parent).map_err(|e| {
            format!(
                "Database parent directory is not writable: {}\nError: {}",
                db_file, e
            )
        }),
        None => Err(format!("Database path has no parent directory: {}", db_file)),
    }
}

/// Validates a task definition before it is stored.
pub fn validate_task(task: &Task) -> Result<()> {
    debug!("Validating task '{}'", task.name);

    let mut problems = Vec::new();
    if task.name.trim().is_empty() {
        problems.push("Task name cannot be empty".to_string());
    }

    validate_sources(task, &mut problems);
    validate_destinations(task, &mut problems);
    validate_schedule(&task.schedule, &mut problems);

    finish(&format!("Task '{}'", task.name), problems)
}

fn validate_sources(task: &Task, problems: &mut Vec<String>) {
    if task.sources.is_empty() {
        problems.push("At least one backup source must be configured".to_string());
    }

    let mut labels = HashSet::new();
    for (idx, source) in task.sources.iter().enumerate() {
        let Some(label) = source.file_name().map(|n| n.to_string_lossy().to_string()) else {
            problems.push(format!(
                "Backup source #{} has no final path component: {}",
                idx + 1,
                source.display()
            ));
            continue;
        };

        if !labels.insert(label.clone()) {
            problems.push(format!(
                "Backup sources must have distinct names; '{}' is used twice",
                label
            ));
        }

        if !source.exists() {
            // Missing sources are reported per run, not rejected here.
            warn!(
                "Backup source #{} does not exist yet: {}",
                idx + 1,
                source.display()
            );
        }
    }
}

fn validate_destinations(task: &Task, problems: &mut Vec<String>) {
    if task.destinations.is_empty() {
        problems.push("At least one backup destination must be configured".to_string());
    }

    let mut ids = HashSet::new();
    for (idx, destination) in task.destinations.iter().enumerate() {
        if destination.id.trim().is_empty() {
            problems.push(format!("Backup destination #{} has an empty id", idx + 1));
        } else if !ids.insert(destination.id.as_str()) {
            problems.push(format!(
                "Destination id '{}' is used more than once",
                destination.id
            ));
        }

        match &destination.target {
            Target::Local { path } | Target::Network { path } => {
                if path.as_os_str().is_empty() {
                    problems.push(format!("Backup destination #{} has an empty path", idx + 1));
                }
            }
            Target::Ftp(ftp) => {
                if ftp.host.trim().is_empty() {
                    problems.push(format!("FTP destination #{} has an empty host", idx + 1));
                }
                if ftp.port == 0 {
                    problems.push(format!("FTP destination #{} has port 0", idx + 1));
                }
                if ftp.path.trim().is_empty() {
                    problems.push(format!(
                        "FTP destination #{} has an empty remote path",
                        idx + 1
                    ));
                }
            }
        }
    }
}

fn validate_schedule(schedule: &Schedule, problems: &mut Vec<String>) {
    if schedule.requires_time() && schedule.time_of_day().is_none() {
        problems.push(format!("Schedule time must be HH:MM, got {:?}", schedule.time));
    }

    match schedule.frequency {
        Frequency::Weekly => {
            if schedule.days.is_empty() {
                problems.push("Weekly schedules need at least one weekday".to_string());
            }
            if let Some(day) = schedule.days.iter().find(|d| **d > 6) {
                problems.push(format!(
                    "Weekday {} is out of range (0 = Sunday .. 6 = Saturday)",
                    day
                ));
            }
        }
        Frequency::Monthly => match schedule.day_of_month {
            Some(day) if (1..=31).contains(&day) => {}
            other => problems.push(format!(
                "Monthly schedules need dayOfMonth in 1..=31, got {:?}",
                other
            )),
        },
        Frequency::Manual | Frequency::Hourly | Frequency::Daily => {}
    }
}

/// Check if a directory is writable by attempting to create a temporary file
fn check_writable(path: &Path) -> std::io::Result<()> {
    let test_file = path.join(".rustybackupengine_write_test");
    fs::write(&test_file, b"test")?;
    fs::remove_file(&test_file)?;
    Ok(())
}
