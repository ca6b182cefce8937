use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to read config file '{path}': {cause}")]
    ConfigRead { path: PathBuf, cause: io::Error },

    #[error("Failed to parse config file '{path}': {cause}")]
    ConfigParse {
        path: PathBuf,
        cause: serde_json::Error,
    },

    #[error("Source unavailable '{path}': {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("Destination '{destination}' unreachable: {reason}")]
    DestinationUnreachable { destination: String, reason: String },

    #[error("Insufficient space on '{destination}': need {required} bytes, {available} available")]
    InsufficientSpace {
        destination: String,
        required: u64,
        available: u64,
    },

    #[error("Checksum mismatch for '{path}' after {attempts} attempt(s)")]
    Integrity { path: String, attempts: u32 },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Failed to open or create database file '{path}': {cause}")]
    DatabaseConnection { path: String, cause: String },

    #[error("Database query failed for '{operation}': {cause}")]
    DatabaseQuery {
        operation: String,
        cause: rusqlite::Error,
    },

    #[error("Failed to update {table} for ID {id}: {cause}")]
    DatabaseUpdate {
        table: String,
        id: String,
        cause: rusqlite::Error,
    },

    #[error("Failed to insert into {table} for {key}: {cause}")]
    DatabaseInsert {
        table: String,
        key: String,
        cause: rusqlite::Error,
    },

    #[error("Failed to (de)serialize {what}: {cause}")]
    Serialization {
        what: String,
        cause: serde_json::Error,
    },

    #[error("Failed to hash file '{path}': {cause}")]
    HashError { path: PathBuf, cause: io::Error },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl BackupError {
    /// Maps the error onto the per-file failure taxonomy stored in run records.
    pub fn kind(&self) -> FailureKind {
        match self {
            BackupError::Config(_)
            | BackupError::ConfigRead { .. }
            | BackupError::ConfigParse { .. } => FailureKind::Config,
            BackupError::SourceUnavailable { .. } | BackupError::HashError { .. } => {
                FailureKind::SourceUnavailable
            }
            BackupError::DestinationUnreachable { .. } => FailureKind::DestinationUnreachable,
            BackupError::InsufficientSpace { .. } => FailureKind::InsufficientSpace,
            BackupError::Integrity { .. } => FailureKind::Integrity,
            BackupError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Internal,
        }
    }
}

/// Serializable error category attached to skipped/failed files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Config,
    SourceUnavailable,
    DestinationUnreachable,
    InsufficientSpace,
    Integrity,
    Cancelled,
    Internal,
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_maps_taxonomy() {
        assert_eq!(
            BackupError::Config("bad".to_string()).kind(),
            FailureKind::Config
        );
        assert_eq!(
            BackupError::Integrity {
                path: "a".to_string(),
                attempts: 3
            }
            .kind(),
            FailureKind::Integrity
        );
        assert_eq!(
            BackupError::InsufficientSpace {
                destination: "d".to_string(),
                required: 10,
                available: 1
            }
            .kind(),
            FailureKind::InsufficientSpace
        );
        assert_eq!(BackupError::Cancelled.kind(), FailureKind::Cancelled);
        assert_eq!(
            BackupError::TaskNotFound("x".to_string()).kind(),
            FailureKind::Internal
        );
    }

    #[test]
    fn test_insufficient_space_message_mentions_sizes() {
        let err = BackupError::InsufficientSpace {
            destination: "/mnt/backup".to_string(),
            required: 2048,
            available: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("2048"));
        assert!(msg.contains("1024"));
    }
}
