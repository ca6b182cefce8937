use crate::models::error::{BackupError, FailureKind, Result};
use crate::models::run_record::FileIssue;
use crate::models::snapshot::{self, Snapshot, SnapshotEntry};
use crate::models::task::{BackupType, Task};
use crate::service::hash::hash_file;
use crate::service::matcher::PathMatcher;
use crate::utils::directory::get_files_in_path;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// A file selected for copying, with the metadata it will be recorded under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFile {
    pub path: PathBuf,
    pub entry: SnapshotEntry,
}

impl CandidateFile {
    pub fn key(&self) -> &str {
        &self.entry.relative_path
    }
}

/// Outcome of change detection for one run.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    /// Type actually executed; differs from the task's when it fell back to full.
    pub effective_type: BackupType,
    pub fell_back_to_full: bool,
    /// Files to copy, sorted by key.
    pub to_copy: Vec<CandidateFile>,
    pub unchanged: Vec<SnapshotEntry>,
    /// Baseline keys no longer present in any available source.
    pub removed: Vec<String>,
    /// Files and sources that could not be read.
    pub skipped: Vec<FileIssue>,
    /// Key prefixes (whole sources or directories) that could not be listed.
    unavailable_prefixes: Vec<String>,
}

struct ScannedFile {
    key: String,
    path: PathBuf,
    size: u64,
    modified_ns: i64,
}

impl ChangeSet {
    /// Build the snapshot that replaces `latest` once the run is over.
    ///
    /// Unchanged files keep their current metadata, delivered files take
    /// their new metadata, and anything that was not delivered anywhere
    /// falls back to the previous `latest` entry so a later run retries it.
    pub fn next_snapshot(&self, delivered: &HashSet<String>, latest: Option<&Snapshot>) -> Snapshot {
        let mut snapshot = Snapshot::new(self.effective_type);

        for entry in &self.unchanged {
            snapshot.insert(entry.clone());
        }

        for file in &self.to_copy {
            if delivered.contains(file.key()) {
                snapshot.insert(file.entry.clone());
            } else if let Some(previous) = latest.and_then(|l| l.get(file.key())) {
                snapshot.insert(previous.clone());
            }
        }

        if let Some(latest) = latest {
            for issue in &self.skipped {
                if let Some(previous) = latest.get(&issue.path) {
                    snapshot.insert(previous.clone());
                }
            }
            for (key, previous) in &latest.entries {
                if under_any_prefix(key, &self.unavailable_prefixes) {
                    snapshot.insert(previous.clone());
                }
            }
        }

        snapshot
    }
}

/// Key prefix of a source: its final path component.
pub fn source_label(source: &Path) -> String {
    source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| source.to_string_lossy().to_string())
}

fn snapshot_key(label: &str, relative: &Path) -> String {
    let mut key = String::from(label);
    for component in relative.components() {
        key.push('/');
        key.push_str(&component.as_os_str().to_string_lossy());
    }
    key
}

fn modified_ns(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn source_issue(path: &Path, reason: String) -> FileIssue {
    FileIssue {
        path: path.to_string_lossy().to_string(),
        destination: None,
        kind: FailureKind::SourceUnavailable,
        reason,
    }
}

/// Compute the files a run of `task` has to copy.
///
/// `latest` is the snapshot of the previous run, `anchor` the snapshot of
/// the last full run. Fails with `SourceUnavailable` only when none of the
/// task's sources can be read.
pub fn detect_changes(
    task: &Task,
    latest: Option<&Snapshot>,
    anchor: Option<&Snapshot>,
    always_hash: bool,
) -> Result<ChangeSet> {
    let matcher = PathMatcher::new(&task.exclude_patterns);
    let mut scanned: Vec<ScannedFile> = Vec::new();
    let mut skipped: Vec<FileIssue> = Vec::new();
    let mut unavailable_prefixes: Vec<String> = Vec::new();
    let mut sources_missing = 0;

    for source in &task.sources {
        let label = source_label(source);
        match scan_source(source, &label, task.options.include_subfolders, &matcher) {
            Ok((files, issues)) => {
                scanned.extend(files);
                unavailable_prefixes.extend(issues.iter().map(|i| i.path.clone()));
                skipped.extend(issues);
            }
            Err(e) => {
                warn!("Source unavailable for task '{}': {}", task.name, e);
                skipped.push(source_issue(source, e.to_string()));
                unavailable_prefixes.push(label);
                sources_missing += 1;
            }
        }
    }

    if sources_missing == task.sources.len() {
        return Err(BackupError::SourceUnavailable {
            path: task.sources.first().cloned().unwrap_or_default(),
            reason: "none of the task's sources could be read".to_string(),
        });
    }

    let (effective_type, baseline) = match task.backup_type {
        BackupType::Full => (BackupType::Full, None),
        BackupType::Incremental => match latest {
            Some(s) => (BackupType::Incremental, Some(s)),
            None => (BackupType::Full, None),
        },
        BackupType::Differential => match anchor {
            Some(s) => (BackupType::Differential, Some(s)),
            None => (BackupType::Full, None),
        },
    };
    let fell_back_to_full = effective_type != task.backup_type;
    if fell_back_to_full {
        info!(
            "No baseline snapshot for {} task '{}', running a full backup",
            task.backup_type, task.name
        );
    }

    // With `always_hash` off, files whose size and mtime match the baseline
    // keep the baseline hash instead of being read.
    let mut current = Snapshot::new(effective_type);
    let mut needs_hash = Vec::new();
    for file in scanned.iter() {
        match baseline.and_then(|b| b.get(&file.key)) {
            Some(prev) if !always_hash && prev.size == file.size && prev.modified_ns == file.modified_ns => {
                current.insert(prev.clone());
            }
            _ => needs_hash.push(file),
        }
    }

    let hashed: Vec<(&ScannedFile, Result<String>)> = needs_hash
        .par_iter()
        .map(|file| (*file, hash_file(&file.path)))
        .collect();

    let mut unhashed: HashSet<&str> = HashSet::new();
    for (file, hash) in hashed {
        match hash {
            Ok(hash) => current.insert(SnapshotEntry {
                relative_path: file.key.clone(),
                size: file.size,
                modified_ns: file.modified_ns,
                hash,
            }),
            Err(e) => {
                warn!("Skipping {}: {}", file.path.display(), e);
                unhashed.insert(file.key.as_str());
                skipped.push(FileIssue {
                    path: file.key.clone(),
                    destination: None,
                    kind: FailureKind::SourceUnavailable,
                    reason: e.to_string(),
                });
            }
        }
    }

    let empty = Snapshot::new(effective_type);
    let changes = snapshot::diff(baseline.unwrap_or(&empty), &current);

    let paths: HashMap<&str, &Path> = scanned.iter().map(|f| (f.key.as_str(), f.path.as_path())).collect();
    let changed = changes.changed();
    let to_copy: Vec<CandidateFile> = changed
        .iter()
        .filter_map(|key| {
            let entry = current.get(key)?.clone();
            let path = paths.get(key.as_str())?.to_path_buf();
            Some(CandidateFile { path, entry })
        })
        .collect();

    let changed: HashSet<&str> = changed.iter().map(String::as_str).collect();
    let unchanged: Vec<SnapshotEntry> = current
        .entries
        .values()
        .filter(|entry| !changed.contains(entry.relative_path.as_str()))
        .cloned()
        .collect();

    let removed: Vec<String> = changes
        .removed
        .into_iter()
        .filter(|key| !unhashed.contains(key.as_str()))
        .filter(|key| !under_any_prefix(key, &unavailable_prefixes))
        .collect();

    info!(
        "Change detection for '{}' ({}): {} to copy, {} unchanged, {} removed, {} skipped",
        task.name,
        effective_type,
        to_copy.len(),
        unchanged.len(),
        removed.len(),
        skipped.len()
    );

    Ok(ChangeSet {
        effective_type,
        fell_back_to_full,
        to_copy,
        unchanged,
        removed,
        skipped,
        unavailable_prefixes,
    })
}

fn under_any_prefix(key: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| {
        key == prefix
            || (key.len() > prefix.len()
                && key.starts_with(prefix.as_str())
                && key.as_bytes()[prefix.len()] == b'/')
    })
}

fn scan_source(
    source: &Path,
    label: &str,
    recursive: bool,
    matcher: &PathMatcher,
) -> Result<(Vec<ScannedFile>, Vec<FileIssue>)> {
    let metadata = fs::metadata(source).map_err(|e| BackupError::SourceUnavailable {
        path: source.to_path_buf(),
        reason: e.to_string(),
    })?;

    if metadata.is_file() {
        if matcher.is_excluded(Path::new(label)) {
            debug!("Source file {} is excluded", source.display());
            return Ok((Vec::new(), Vec::new()));
        }
        let file = ScannedFile {
            key: label.to_string(),
            path: source.to_path_buf(),
            size: metadata.len(),
            modified_ns: modified_ns(&metadata),
        };
        return Ok((vec![file], Vec::new()));
    }

    let listing = get_files_in_path(source, recursive, |relative, _| matcher.is_excluded(relative))?;

    let mut files = Vec::with_capacity(listing.files.len());
    let to_key = |path: &Path| snapshot_key(label, path.strip_prefix(source).unwrap_or(path));
    let mut issues: Vec<FileIssue> = listing
        .unreadable
        .into_iter()
        .map(|(path, reason)| source_issue(Path::new(&to_key(&path)), reason))
        .collect();

    for path in listing.files {
        let key = to_key(&path);
        match fs::metadata(&path) {
            Ok(meta) => files.push(ScannedFile {
                key,
                path,
                size: meta.len(),
                modified_ns: modified_ns(&meta),
            }),
            Err(e) => issues.push(source_issue(Path::new(&key), e.to_string())),
        }
    }

    Ok((files, issues))
}
