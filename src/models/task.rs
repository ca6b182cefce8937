use crate::models::destination::Destination;
use crate::models::schedule::Schedule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
    Differential,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Differential => "differential",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(BackupType::Full),
            "incremental" => Some(BackupType::Incremental),
            "differential" => Some(BackupType::Differential),
            _ => None,
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Running,
    Success,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMethod {
    Aes128,
    Aes256,
}

impl EncryptionMethod {
    pub fn key_len(&self) -> usize {
        match self {
            EncryptionMethod::Aes128 => 16,
            EncryptionMethod::Aes256 => 32,
        }
    }
}

impl Default for EncryptionMethod {
    fn default() -> Self {
        EncryptionMethod::Aes256
    }
}

/// Per-task option flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    #[serde(default = "bool_true")]
    pub include_subfolders: bool,
    #[serde(default, rename = "useVSS")]
    pub use_vss: bool,
    #[serde(default = "bool_true")]
    pub compression: bool,
    #[serde(default)]
    pub encryption: bool,
    #[serde(default)]
    pub encryption_method: EncryptionMethod,
    #[serde(default = "bool_true", rename = "verifyCRC")]
    pub verify_checksum: bool,
    #[serde(default = "bool_true")]
    pub create_versioned_backups: bool,
    /// With versioned + compressed output, pack the whole run into one archive.
    #[serde(default = "bool_true")]
    pub archive_per_run: bool,
}

const fn bool_true() -> bool {
    true
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            include_subfolders: true,
            use_vss: false,
            compression: true,
            encryption: false,
            encryption_method: EncryptionMethod::Aes256,
            verify_checksum: true,
            create_versioned_backups: true,
            archive_per_run: true,
        }
    }
}

impl TaskOptions {
    /// True when a run writes one archive per destination instead of one
    /// object per file.
    pub fn writes_archive(&self) -> bool {
        self.compression && self.create_versioned_backups && self.archive_per_run
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub sources: Vec<PathBuf>,
    pub destinations: Vec<Destination>,
    pub schedule: Schedule,
    #[serde(flatten)]
    pub options: TaskOptions,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    pub status: TaskStatus,
}

impl Task {
    /// Filesystem-friendly form of the task name, used for versioned folders.
    pub fn slug(&self) -> String {
        let slug: String = self
            .name
            .trim()
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if slug.is_empty() {
            self.id.clone()
        } else {
            slug
        }
    }
}

/// Everything a caller supplies to create a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskDraft {
    pub name: String,
    pub enabled: bool,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub sources: Vec<PathBuf>,
    pub destinations: Vec<Destination>,
    pub schedule: Schedule,
    #[serde(flatten)]
    pub options: TaskOptions,
    pub exclude_patterns: Vec<String>,
}

impl Default for TaskDraft {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            backup_type: BackupType::Incremental,
            sources: Vec::new(),
            destinations: Vec::new(),
            schedule: Schedule::default(),
            options: TaskOptions::default(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl TaskDraft {
    pub fn into_task(self, id: String) -> Task {
        Task {
            id,
            name: self.name.trim().to_string(),
            enabled: self.enabled,
            backup_type: self.backup_type,
            sources: self.sources,
            destinations: self.destinations,
            schedule: self.schedule,
            options: self.options,
            exclude_patterns: self.exclude_patterns,
            last_run: None,
            next_run: None,
            status: TaskStatus::Idle,
        }
    }
}

/// Explicit set of fields a caller may change on an existing task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    #[serde(rename = "type")]
    pub backup_type: Option<BackupType>,
    pub sources: Option<Vec<PathBuf>>,
    pub destinations: Option<Vec<Destination>>,
    pub schedule: Option<Schedule>,
    pub options: Option<TaskOptions>,
    pub exclude_patterns: Option<Vec<String>>,
}

impl TaskUpdate {
    /// Produce the merged task; validation happens on the result.
    pub fn apply(&self, task: &Task) -> Task {
        let mut merged = task.clone();
        if let Some(name) = &self.name {
            merged.name = name.trim().to_string();
        }
        if let Some(enabled) = self.enabled {
            merged.enabled = enabled;
        }
        if let Some(backup_type) = self.backup_type {
            merged.backup_type = backup_type;
        }
        if let Some(sources) = &self.sources {
            merged.sources = sources.clone();
        }
        if let Some(destinations) = &self.destinations {
            merged.destinations = destinations.clone();
        }
        if let Some(schedule) = &self.schedule {
            merged.schedule = schedule.clone();
        }
        if let Some(options) = &self.options {
            merged.options = options.clone();
        }
        if let Some(patterns) = &self.exclude_patterns {
            merged.exclude_patterns = patterns.clone();
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.enabled.is_none()
            && self.backup_type.is_none()
            && self.sources.is_none()
            && self.destinations.is_none()
            && self.schedule.is_none()
            && self.options.is_none()
            && self.exclude_patterns.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::schedule::Frequency;

    #[test]
    fn test_draft_defaults_match_editor() {
        let draft = TaskDraft::default();
        assert!(draft.enabled);
        assert_eq!(draft.backup_type, BackupType::Incremental);
        assert_eq!(draft.schedule.frequency, Frequency::Daily);
        assert_eq!(draft.schedule.time.as_deref(), Some("02:00"));
        assert!(draft.options.include_subfolders);
        assert!(!draft.options.use_vss);
        assert!(draft.options.compression);
        assert!(!draft.options.encryption);
        assert!(draft.options.verify_checksum);
        assert!(draft.options.create_versioned_backups);
    }

    #[test]
    fn test_task_json_uses_ui_field_names() {
        let task = TaskDraft {
            name: "Docs".to_string(),
            ..TaskDraft::default()
        }
        .into_task("t1".to_string());
        let value = serde_json::to_value(&task).unwrap();

        assert_eq!(value["type"], "incremental");
        assert_eq!(value["useVSS"], false);
        assert_eq!(value["verifyCRC"], true);
        assert_eq!(value["excludePatterns"], serde_json::json!([]));
        assert_eq!(value["status"], "idle");

        let back: Task = serde_json::from_value(value).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_update_only_touches_given_fields() {
        let task = TaskDraft {
            name: "Docs".to_string(),
            ..TaskDraft::default()
        }
        .into_task("t1".to_string());

        let update = TaskUpdate {
            name: Some("  Renamed ".to_string()),
            backup_type: Some(BackupType::Full),
            ..TaskUpdate::default()
        };
        let merged = update.apply(&task);

        assert_eq!(merged.name, "Renamed");
        assert_eq!(merged.backup_type, BackupType::Full);
        assert_eq!(merged.schedule, task.schedule);
        assert_eq!(merged.id, task.id);
        assert!(TaskUpdate::default().is_empty());
        assert!(!update.is_empty());
    }

    #[test]
    fn test_slug_replaces_separators() {
        let task = TaskDraft {
            name: "Base de données/prod".to_string(),
            ..TaskDraft::default()
        }
        .into_task("t1".to_string());
        assert_eq!(task.slug(), "Base_de_données_prod");
    }

    #[test]
    fn test_archive_only_when_versioned_and_compressed() {
        let mut options = TaskOptions::default();
        assert!(options.writes_archive());
        options.create_versioned_backups = false;
        assert!(!options.writes_archive());
        options.create_versioned_backups = true;
        options.compression = false;
        assert!(!options.writes_archive());
    }
}
