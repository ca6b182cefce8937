use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use log::warn;
use std::path::Path;

/// Compiled exclude patterns for one task.
///
/// Patterns without a `/` are matched against the base name of a path,
/// patterns containing one against the whole path relative to the source
/// root. A pattern that fails to compile is dropped, so it never excludes
/// anything.
#[derive(Clone)]
pub struct PathMatcher {
    by_name: GlobSet,
    by_path: GlobSet,
    active: usize,
}

impl PathMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut by_name = GlobSetBuilder::new();
        let mut by_path = GlobSetBuilder::new();
        let mut active = 0;

        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            let normalized = pattern.trim_start_matches("./");
            match GlobBuilder::new(normalized).literal_separator(true).build() {
                Ok(glob) => {
                    if normalized.contains('/') {
                        by_path.add(glob);
                    } else {
                        by_name.add(glob);
                    }
                    active += 1;
                }
                Err(e) => warn!("Ignoring malformed exclude pattern '{}': {}", pattern, e),
            }
        }

        Self {
            by_name: by_name.build().unwrap_or_else(|_| GlobSet::empty()),
            by_path: by_path.build().unwrap_or_else(|_| GlobSet::empty()),
            active,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// True when `relative_path` (relative to its source root) is excluded.
    pub fn is_excluded(&self, relative_path: &Path) -> bool {
        if self.is_empty() {
            return false;
        }
        let name_hit = relative_path
            .file_name()
            .is_some_and(|name| self.by_name.is_match(Path::new(name)));
        if name_hit {
            return true;
        }
        let unified = relative_path.to_string_lossy().replace('\\', "/");
        self.by_path.is_match(unified.as_str())
    }
}

/// One-shot form of [`PathMatcher::is_excluded`].
pub fn matches<S: AsRef<str>>(path: &Path, patterns: &[S]) -> bool {
    PathMatcher::new(patterns).is_excluded(path)
}
