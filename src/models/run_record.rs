use crate::models::error::FailureKind;
use crate::models::task::BackupType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Warning,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Warning => "warning",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// A file that was skipped or failed, with the destination it concerns
/// (`None` when the problem is on the source side).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileIssue {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub kind: FailureKind,
    pub reason: String,
}

/// Immutable record of one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub task_id: String,
    pub task_name: String,
    pub timestamp: DateTime<Utc>,
    pub status: RunStatus,
    pub message: String,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub files_processed: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub files_removed: u64,
    pub destinations_failed: u32,
    pub total_bytes: u64,
    pub duration_ms: u64,
    /// Human-readable forms of `total_bytes` and `duration_ms`.
    pub size: String,
    pub duration: String,
    #[serde(default)]
    pub failures: Vec<FileIssue>,
}

/// Query over the append-only run log. All criteria are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    pub task_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn for_task(task_id: &str) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            ..Self::default()
        }
    }
}
