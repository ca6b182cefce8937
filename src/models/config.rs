use crate::models::config_validator::validate_config;
use crate::models::error::{BackupError, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database_file: String,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "u64_sixty")]
    pub scheduler_poll_secs: u64,
    #[serde(default = "u32_two")]
    pub integrity_retries: u32,
    #[serde(default = "default_free_space_margin")]
    pub free_space_margin_bytes: u64,
    #[serde(default = "usize_twenty")]
    pub max_logged_failures: usize,
    /// Hash every file even when size and mtime match the baseline.
    /// Turning this off trusts metadata for unchanged files.
    #[serde(default = "bool_true")]
    pub always_hash: bool,
    #[serde(default = "default_password_env")]
    pub encryption_password_env: String,
    #[serde(default)]
    pub ftp: FtpSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpSettings {
    #[serde(default = "u64_fifteen")]
    pub connect_timeout_secs: u64,
    #[serde(default = "u64_sixty")]
    pub operation_timeout_secs: u64,
    #[serde(default = "u32_four")]
    pub max_attempts: u32,
    #[serde(default = "u64_five_hundred")]
    pub initial_backoff_ms: u64,
    #[serde(default = "u64_eight_thousand")]
    pub max_backoff_ms: u64,
}

impl Default for FtpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            operation_timeout_secs: 60,
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
        }
    }
}

impl FtpSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("rusty-backup-engine")
}
fn default_max_concurrent_runs() -> usize {
    num_cpus::get_physical()
}
fn default_password_env() -> String {
    "BACKUP_ENGINE_PASSWORD".to_string()
}
const fn default_free_space_margin() -> u64 {
    64 * 1024 * 1024
}
const fn u64_sixty() -> u64 {
    60
}
const fn u64_fifteen() -> u64 {
    15
}
const fn u64_five_hundred() -> u64 {
    500
}
const fn u64_eight_thousand() -> u64 {
    8000
}
const fn u32_two() -> u32 {
    2
}
const fn u32_four() -> u32 {
    4
}
const fn usize_twenty() -> usize {
    20
}
const fn bool_true() -> bool {
    true
}

impl EngineConfig {
    /// Config with every default applied, backed by the given database file.
    pub fn with_database(database_file: &str) -> Self {
        Self {
            database_file: database_file.to_string(),
            staging_dir: default_staging_dir(),
            max_concurrent_runs: default_max_concurrent_runs(),
            scheduler_poll_secs: 60,
            integrity_retries: 2,
            free_space_margin_bytes: default_free_space_margin(),
            max_logged_failures: 20,
            always_hash: true,
            encryption_password_env: default_password_env(),
            ftp: FtpSettings::default(),
        }
    }
}

pub fn setup_config(config_file: String) -> Result<EngineConfig> {
    let config_path = PathBuf::from(config_file);
    info!("Loading config from: {}", config_path.display());

    let config_str = fs::read_to_string(&config_path).map_err(|cause| {
        BackupError::ConfigRead {
            path: config_path.clone(),
            cause,
        }
    })?;

    let config: EngineConfig = serde_json::from_str(&config_str).map_err(|cause| {
        BackupError::ConfigParse {
            path: config_path,
            cause,
        }
    })?;

    validate_config(&config)?;

    Ok(config)
}
