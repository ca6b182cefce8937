use crate::models::error::{BackupError, Result};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Provides a point-in-time view of a file that may be in use.
pub trait SnapshotCapture: Send + Sync {
    /// Produce a stable copy of `source` inside `staging` and return its path.
    fn capture(&self, source: &Path, staging: &Path, name: &str) -> Result<PathBuf>;
}

/// Portable capture: copy the file into the staging area and reject the
/// copy if the source changed while it was being read.
pub struct StagedCopyCapture;

fn fingerprint(path: &Path) -> Result<(u64, Option<SystemTime>)> {
    let meta = fs::metadata(path).map_err(|e| BackupError::SourceUnavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok((meta.len(), meta.modified().ok()))
}

impl SnapshotCapture for StagedCopyCapture {
    fn capture(&self, source: &Path, staging: &Path, name: &str) -> Result<PathBuf> {
        let before = fingerprint(source)?;
        let target = staging.join(name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::copy(source, &target).map_err(|e| BackupError::SourceUnavailable {
            path: source.to_path_buf(),
            reason: format!("capture failed: {}", e),
        })?;

        let after = fingerprint(source)?;
        if before != after {
            let _ = fs::remove_file(&target);
            return Err(BackupError::SourceUnavailable {
                path: source.to_path_buf(),
                reason: "file changed while it was being captured".to_string(),
            });
        }

        debug!("Captured {} -> {}", source.display(), target.display());
        Ok(target)
    }
}
