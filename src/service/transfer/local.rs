use crate::models::error::{BackupError, Result};
use crate::service::hash::HashingWriter;
use crate::service::transfer::DestinationSink;
use log::{debug, warn};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::Disks;
use tempfile::NamedTempFile;

/// Reports free space for the volume holding a path.
pub trait SpaceProbe: Send + Sync {
    /// `None` when the volume cannot be identified; the check is skipped.
    fn available_space(&self, path: &Path) -> Option<u64>;
}

/// Looks the path up in the mounted disks, picking the longest matching
/// mount point.
pub struct SysinfoSpaceProbe;

impl SpaceProbe for SysinfoSpaceProbe {
    fn available_space(&self, path: &Path) -> Option<u64> {
        let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// Writes objects below a directory on a local disk or mounted share.
pub struct LocalSink {
    destination: String,
    root: PathBuf,
    probe: Arc<dyn SpaceProbe>,
    margin: u64,
}

impl LocalSink {
    pub fn new(destination: &str, root: &Path, probe: Arc<dyn SpaceProbe>, margin: u64) -> Self {
        Self {
            destination: destination.to_string(),
            root: root.to_path_buf(),
            probe,
            margin,
        }
    }

    fn target(&self, name: &str) -> PathBuf {
        name.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    fn unreachable(&self, reason: impl ToString) -> BackupError {
        BackupError::DestinationUnreachable {
            destination: self.destination.clone(),
            reason: reason.to_string(),
        }
    }
}

impl DestinationSink for LocalSink {
    fn preflight(&mut self, pending_bytes: u64) -> Result<()> {
        fs::create_dir_all(&self.root)
            .map_err(|e| self.unreachable(format!("cannot create {}: {}", self.root.display(), e)))?;

        let required = pending_bytes.saturating_add(self.margin);
        match self.probe.available_space(&self.root) {
            Some(available) if available < required => Err(BackupError::InsufficientSpace {
                destination: self.destination.clone(),
                required,
                available,
            }),
            Some(available) => {
                debug!(
                    "{}: {} bytes available, {} required",
                    self.destination, available, required
                );
                Ok(())
            }
            None => {
                warn!(
                    "Could not determine free space for {}, skipping check",
                    self.root.display()
                );
                Ok(())
            }
        }
    }

    fn store(&mut self, name: &str, staged: &Path) -> Result<()> {
        let target = self.target(name);
        let parent = target.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).map_err(|e| self.unreachable(e))?;

        // Write next to the target and rename, so a failed write never
        // replaces the previous object.
        let mut temp = NamedTempFile::new_in(&parent).map_err(|e| self.unreachable(e))?;
        let mut source = File::open(staged)?;
        io::copy(&mut source, temp.as_file_mut()).map_err(|e| self.unreachable(e))?;
        temp.as_file().sync_all().map_err(|e| self.unreachable(e))?;
        temp.persist(&target).map_err(|e| self.unreachable(e.error))?;
        Ok(())
    }

    fn stored_hash(&mut self, name: &str) -> Result<String> {
        let mut stored = File::open(self.target(name)).map_err(|e| self.unreachable(e))?;
        let mut hashing = HashingWriter::new(io::sink());
        io::copy(&mut stored, &mut hashing).map_err(|e| self.unreachable(e))?;
        let (_, digest, _) = hashing.finish();
        Ok(digest)
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        match fs::remove_file(self.target(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.unreachable(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FixedSpace(Option<u64>);

    impl SpaceProbe for FixedSpace {
        fn available_space(&self, _path: &Path) -> Option<u64> {
            self.0
        }
    }

    fn staged(dir: &TempDir, content: &[u8]) -> PathBuf {
        let path = dir.path().join("staged");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_store_creates_intermediate_directories() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let mut sink = LocalSink::new("d1", root.path(), Arc::new(FixedSpace(None)), 0);

        sink.store("docs/2024/report.txt", &staged(&staging, b"hello")).unwrap();
        let written = root.path().join("docs").join("2024").join("report.txt");
        assert_eq!(fs::read(written).unwrap(), b"hello");
    }

    #[test]
    fn test_store_overwrites_in_place() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let mut sink = LocalSink::new("d1", root.path(), Arc::new(FixedSpace(None)), 0);

        sink.store("a.txt", &staged(&staging, b"first")).unwrap();
        sink.store("a.txt", &staged(&staging, b"second")).unwrap();
        assert_eq!(fs::read(root.path().join("a.txt")).unwrap(), b"second");

        let leftovers = fs::read_dir(root.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_stored_hash_matches_content_hash() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let mut sink = LocalSink::new("d1", root.path(), Arc::new(FixedSpace(None)), 0);
        let path = staged(&staging, b"verify me");

        sink.store("v.bin", &path).unwrap();
        assert_eq!(
            sink.stored_hash("v.bin").unwrap(),
            crate::service::hash::hash_file(&path).unwrap()
        );
    }

    #[test]
    fn test_preflight_rejects_insufficient_space() {
        let root = TempDir::new().unwrap();
        let mut sink = LocalSink::new("d1", root.path(), Arc::new(FixedSpace(Some(1000))), 100);

        assert!(sink.preflight(900).is_ok());
        match sink.preflight(901) {
            Err(BackupError::InsufficientSpace {
                required,
                available,
                ..
            }) => {
                assert_eq!(required, 1001);
                assert_eq!(available, 1000);
            }
            other => panic!("expected InsufficientSpace, got {:?}", other),
        }
    }

    #[test]
    fn test_preflight_creates_root() {
        let base = TempDir::new().unwrap();
        let root = base.path().join("new").join("target");
        let mut sink = LocalSink::new("d1", &root, Arc::new(FixedSpace(None)), 0);
        sink.preflight(10).unwrap();
        assert!(root.is_dir());
    }

    #[test]
    fn test_remove_missing_object_is_ok() {
        let root = TempDir::new().unwrap();
        let mut sink = LocalSink::new("d1", root.path(), Arc::new(FixedSpace(None)), 0);
        assert!(sink.remove("never/written").is_ok());
    }

    #[test]
    fn test_sysinfo_probe_does_not_panic() {
        let dir = TempDir::new().unwrap();
        let _ = SysinfoSpaceProbe.available_space(dir.path());
    }
}
