use crate::models::error::{BackupError, Result};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Files found under one source directory plus the entries that could not be read.
#[derive(Debug, Default)]
pub struct DirectoryListing {
    pub files: Vec<PathBuf>,
    pub unreadable: Vec<(PathBuf, String)>,
}

/// Walk `dir` and collect regular files. `skip` gets the path relative to
/// `dir` and whether it is a directory; returning true prunes the entry
/// (and everything below it for directories).
pub fn get_files_in_path<F>(dir: &Path, recursive: bool, mut skip: F) -> Result<DirectoryListing>
where
    F: FnMut(&Path, bool) -> bool,
{
    let metadata = fs::metadata(dir).map_err(|e| BackupError::SourceUnavailable {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !metadata.is_dir() {
        return Err(BackupError::SourceUnavailable {
            path: dir.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut listing = DirectoryListing::default();

    let walker = WalkDir::new(dir)
        .max_depth(max_depth)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            !skip(relative, entry.file_type().is_dir())
        });

    for entry in walker {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() {
                    listing.files.push(entry.path().to_path_buf());
                }
            }
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
                warn!("Skipping unreadable entry {}: {}", path.display(), e);
                listing.unreadable.push((path, e.to_string()));
            }
        }
    }

    debug!(
        "Found {} files in {} ({} unreadable)",
        listing.files.len(),
        dir.display(),
        listing.unreadable.len()
    );
    Ok(listing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("nested/deeper")).unwrap();
        fs::create_dir_all(root.join("node_modules")).unwrap();
        fs::write(root.join("top.txt"), b"top").unwrap();
        fs::write(root.join("nested/inner.txt"), b"inner").unwrap();
        fs::write(root.join("nested/deeper/deep.txt"), b"deep").unwrap();
        fs::write(root.join("node_modules/dep.js"), b"dep").unwrap();
    }

    #[test]
    fn test_recursive_listing() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());

        let listing = get_files_in_path(temp.path(), true, |_, _| false).unwrap();
        assert_eq!(listing.files.len(), 4);
        assert!(listing.unreadable.is_empty());
    }

    #[test]
    fn test_top_level_only() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());

        let listing = get_files_in_path(temp.path(), false, |_, _| false).unwrap();
        assert_eq!(listing.files, vec![temp.path().join("top.txt")]);
    }

    #[test]
    fn test_skip_prunes_directories() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());

        let listing = get_files_in_path(temp.path(), true, |rel, is_dir| {
            is_dir && rel.file_name().is_some_and(|n| n == "node_modules")
        })
        .unwrap();
        assert_eq!(listing.files.len(), 3);
        assert!(!listing
            .files
            .iter()
            .any(|p| p.to_string_lossy().contains("node_modules")));
    }

    #[test]
    fn test_missing_directory_is_source_unavailable() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("gone");
        match get_files_in_path(&missing, true, |_, _| false) {
            Err(BackupError::SourceUnavailable { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected SourceUnavailable, got {:?}", other),
        }
    }
}
