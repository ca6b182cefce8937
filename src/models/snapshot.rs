use crate::models::task::BackupType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which of the two snapshots kept per task a row belongs to. `Latest` is
/// the baseline for incremental runs, `Anchor` the last full run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Latest,
    Anchor,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Latest => "latest",
            SnapshotKind::Anchor => "anchor",
        }
    }
}

/// Metadata of one source file as of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub relative_path: String,
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub modified_ns: i64,
    pub hash: String,
}

impl SnapshotEntry {
    pub fn same_metadata(&self, other: &SnapshotEntry) -> bool {
        self.size == other.size && self.modified_ns == other.modified_ns
    }
}

/// All entries recorded for one task at one point in time, keyed by
/// relative path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    /// Type of the run that produced this snapshot.
    pub origin: BackupType,
    pub entries: BTreeMap<String, SnapshotEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl SnapshotDiff {
    /// Paths that need copying (added + modified), sorted.
    pub fn changed(&self) -> Vec<String> {
        let mut changed: Vec<String> = self
            .added
            .iter()
            .chain(self.modified.iter())
            .cloned()
            .collect();
        changed.sort();
        changed
    }
}

impl Snapshot {
    pub fn new(origin: BackupType) -> Self {
        Self {
            taken_at: Utc::now(),
            origin,
            entries: BTreeMap::new(),
        }
    }

    pub fn from_entries<I>(origin: BackupType, entries: I) -> Self
    where
        I: IntoIterator<Item = SnapshotEntry>,
    {
        Self {
            taken_at: Utc::now(),
            origin,
            entries: entries
                .into_iter()
                .map(|e| (e.relative_path.clone(), e))
                .collect(),
        }
    }

    pub fn insert(&mut self, entry: SnapshotEntry) {
        self.entries.insert(entry.relative_path.clone(), entry);
    }

    pub fn get(&self, relative_path: &str) -> Option<&SnapshotEntry> {
        self.entries.get(relative_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compare two snapshots. An entry is modified when its hash differs or
/// when size and modification time together differ.
pub fn diff(old: &Snapshot, new: &Snapshot) -> SnapshotDiff {
    let mut result = SnapshotDiff::default();

    for (path, entry) in &new.entries {
        match old.entries.get(path) {
            None => result.added.push(path.clone()),
            Some(previous) => {
                if previous.hash != entry.hash || !previous.same_metadata(entry) {
                    result.modified.push(path.clone());
                }
            }
        }
    }

    for path in old.entries.keys() {
        if !new.entries.contains_key(path) {
            result.removed.push(path.clone());
        }
    }

    result
}
