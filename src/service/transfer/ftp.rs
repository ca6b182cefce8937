use crate::models::config::FtpSettings;
use crate::models::destination::FtpTarget;
use crate::models::error::{BackupError, Result};
use crate::service::hash::HashingWriter;
use crate::service::transfer::DestinationSink;
use log::{debug, info, warn};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};
use thiserror::Error;

/// FTP errors split by whether reconnecting may help.
#[derive(Error, Debug)]
pub enum FtpFailure {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

type FtpResult<T> = std::result::Result<T, FtpFailure>;

/// An authenticated connection in binary mode.
pub trait FtpSession: Send {
    /// Upload to `remote_path`, creating missing parent directories.
    fn put(&mut self, remote_path: &str, data: &mut dyn Read) -> FtpResult<()>;
    fn get(&mut self, remote_path: &str, out: &mut dyn Write) -> FtpResult<()>;
    fn delete(&mut self, remote_path: &str) -> FtpResult<()>;
    fn quit(&mut self);
}

pub trait FtpConnector: Send + Sync {
    fn connect(&self, target: &FtpTarget, settings: &FtpSettings) -> FtpResult<Box<dyn FtpSession>>;
}

fn classify(e: FtpError) -> FtpFailure {
    match e {
        FtpError::ConnectionError(io) => FtpFailure::Transient(io.to_string()),
        other => FtpFailure::Permanent(other.to_string()),
    }
}

/// Connector backed by the synchronous `suppaftp` client.
pub struct SuppaftpConnector;

impl FtpConnector for SuppaftpConnector {
    fn connect(&self, target: &FtpTarget, settings: &FtpSettings) -> FtpResult<Box<dyn FtpSession>> {
        let address = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|e| FtpFailure::Transient(format!("cannot resolve {}: {}", target.host, e)))?
            .next()
            .ok_or_else(|| FtpFailure::Permanent(format!("no address for {}", target.host)))?;

        let mut stream = FtpStream::connect_timeout(address, settings.connect_timeout()).map_err(classify)?;
        let timeout = Some(settings.operation_timeout());
        stream
            .get_ref()
            .set_read_timeout(timeout)
            .map_err(|e| FtpFailure::Transient(e.to_string()))?;
        stream
            .get_ref()
            .set_write_timeout(timeout)
            .map_err(|e| FtpFailure::Transient(e.to_string()))?;

        let user = if target.username.is_empty() {
            "anonymous"
        } else {
            target.username.as_str()
        };
        stream.login(user, target.password.as_str()).map_err(classify)?;
        stream.set_mode(if target.passive { Mode::Passive } else { Mode::Active });
        stream.transfer_type(FileType::Binary).map_err(classify)?;

        debug!("Connected to ftp://{}:{}", target.host, target.port);
        Ok(Box::new(SuppaftpSession { stream }))
    }
}

struct SuppaftpSession {
    stream: FtpStream,
}

/// Directories leading to `remote_path`, outermost first. Relative paths
/// stay relative to the login directory.
fn parent_dirs(remote_path: &str) -> Vec<String> {
    let Some((parent, _)) = remote_path.rsplit_once('/') else {
        return Vec::new();
    };
    let mut dirs = Vec::new();
    let mut current = String::new();
    if remote_path.starts_with('/') {
        current.push('/');
    }
    for part in parent.split('/').filter(|p| !p.is_empty()) {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(part);
        dirs.push(current.clone());
    }
    dirs
}

impl SuppaftpSession {
    fn ensure_parent(&mut self, remote_path: &str) {
        for dir in parent_dirs(remote_path) {
            // Existing directories answer with an error; the upload reports
            // anything that is really missing.
            let _ = self.stream.mkdir(&dir);
        }
    }
}

impl FtpSession for SuppaftpSession {
    fn put(&mut self, remote_path: &str, mut data: &mut dyn Read) -> FtpResult<()> {
        self.ensure_parent(remote_path);
        let partial = format!("{}.part", remote_path);
        self.stream.put_file(&partial, &mut data).map_err(classify)?;
        // Some servers refuse to rename over an existing file.
        let _ = self.stream.rm(remote_path);
        self.stream.rename(partial.as_str(), remote_path).map_err(classify)?;
        Ok(())
    }

    fn get(&mut self, remote_path: &str, out: &mut dyn Write) -> FtpResult<()> {
        self.stream
            .retr(remote_path, |reader| {
                io::copy(reader, &mut *out).map_err(FtpError::ConnectionError)
            })
            .map_err(classify)?;
        Ok(())
    }

    fn delete(&mut self, remote_path: &str) -> FtpResult<()> {
        self.stream.rm(remote_path).map_err(classify)
    }

    fn quit(&mut self) {
        if let Err(e) = self.stream.quit() {
            debug!("FTP quit failed: {}", e);
        }
    }
}

/// One FTP session per destination per run, reconnected with exponential
/// backoff when the connection drops.
pub struct FtpSink {
    destination: String,
    target: FtpTarget,
    settings: FtpSettings,
    connector: Arc<dyn FtpConnector>,
    session: Option<Box<dyn FtpSession>>,
    cancel: Arc<AtomicBool>,
}

impl FtpSink {
    pub fn new(
        destination: &str,
        target: &FtpTarget,
        settings: &FtpSettings,
        connector: Arc<dyn FtpConnector>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            destination: destination.to_string(),
            target: target.clone(),
            settings: settings.clone(),
            connector,
            session: None,
            cancel,
        }
    }

    fn remote_path(&self, name: &str) -> String {
        let root = self.target.path.trim_end_matches('/');
        format!("{}/{}", root, name.trim_start_matches('/'))
    }

    fn unreachable(&self, reason: impl ToString) -> BackupError {
        BackupError::DestinationUnreachable {
            destination: self.destination.clone(),
            reason: reason.to_string(),
        }
    }

    /// Sleep in short slices so a cancelled run does not wait out the
    /// whole backoff. Returns false when cancelled.
    fn pause(&self, delay: Duration) -> bool {
        let until = Instant::now() + delay;
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            thread::sleep((until - now).min(Duration::from_millis(100)));
        }
    }

    fn with_retry<T, F>(&mut self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut(&mut dyn FtpSession) -> FtpResult<T>,
    {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = match self.session.as_mut() {
                Some(session) => op(session.as_mut()),
                None => match self.connector.connect(&self.target, &self.settings) {
                    Ok(mut session) => {
                        let outcome = op(session.as_mut());
                        self.session = Some(session);
                        outcome
                    }
                    Err(e) => Err(e),
                },
            };

            let reason = match outcome {
                Ok(value) => return Ok(value),
                Err(FtpFailure::Permanent(reason)) => {
                    return Err(self.unreachable(format!("{} failed: {}", operation, reason)));
                }
                Err(FtpFailure::Transient(reason)) => reason,
            };

            if let Some(mut session) = self.session.take() {
                session.quit();
            }
            if attempt >= max_attempts {
                return Err(self.unreachable(format!(
                    "{} failed after {} attempt(s): {}",
                    operation, attempt, reason
                )));
            }

            let delay = self.settings.backoff(attempt);
            warn!(
                "{}: {} failed ({}), retrying in {}ms",
                self.destination,
                operation,
                reason,
                delay.as_millis()
            );
            if !self.pause(delay) {
                return Err(BackupError::Cancelled);
            }
            attempt += 1;
        }
    }
}

impl DestinationSink for FtpSink {
    fn preflight(&mut self, _pending_bytes: u64) -> Result<()> {
        self.with_retry("connect", |_| Ok(()))?;
        info!("{}: connected", self.destination);
        Ok(())
    }

    fn store(&mut self, name: &str, staged: &Path) -> Result<()> {
        let remote = self.remote_path(name);
        self.with_retry("upload", |session| {
            let mut file = File::open(staged).map_err(|e| FtpFailure::Permanent(e.to_string()))?;
            session.put(&remote, &mut file)
        })
    }

    fn stored_hash(&mut self, name: &str) -> Result<String> {
        let remote = self.remote_path(name);
        self.with_retry("read back", |session| {
            let mut hashing = HashingWriter::new(io::sink());
            session.get(&remote, &mut hashing)?;
            let (_, digest, _) = hashing.finish();
            Ok(digest)
        })
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        let remote = self.remote_path(name);
        self.with_retry("delete", |session| session.delete(&remote))
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.quit();
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::mpsc::Receiver;
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory FTP server shared by all sessions it hands out.
    #[derive(Default)]
    pub struct FakeFtp {
        pub files: Mutex<HashMap<String, Vec<u8>>>,
        pub connects: Mutex<u32>,
        /// Connection attempts that fail before one succeeds.
        pub failing_connects: Mutex<u32>,
        /// Uploads that drop the connection before completing.
        pub failing_puts: Mutex<u32>,
        pub refuse_login: bool,
        /// When set, connecting blocks until a message arrives.
        pub connect_gate: Mutex<Option<Receiver<()>>>,
    }

    impl FakeFtp {
        pub fn file(&self, path: &str) -> Option<Vec<u8>> {
            self.files.lock().unwrap().get(path).cloned()
        }
    }

    pub struct FakeConnector(pub Arc<FakeFtp>);

    struct FakeSession(Arc<FakeFtp>);

    fn take_one(counter: &Mutex<u32>) -> bool {
        let mut remaining = counter.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }

    impl FtpConnector for FakeConnector {
        fn connect(&self, _target: &FtpTarget, _settings: &FtpSettings) -> FtpResult<Box<dyn FtpSession>> {
            *self.0.connects.lock().unwrap() += 1;
            if let Some(gate) = self.0.connect_gate.lock().unwrap().as_ref() {
                let _ = gate.recv_timeout(Duration::from_secs(30));
            }
            if self.0.refuse_login {
                return Err(FtpFailure::Permanent("530 Login incorrect".to_string()));
            }
            if take_one(&self.0.failing_connects) {
                return Err(FtpFailure::Transient("connection refused".to_string()));
            }
            Ok(Box::new(FakeSession(Arc::clone(&self.0))))
        }
    }

    impl FtpSession for FakeSession {
        fn put(&mut self, remote_path: &str, data: &mut dyn Read) -> FtpResult<()> {
            if take_one(&self.0.failing_puts) {
                return Err(FtpFailure::Transient("connection reset".to_string()));
            }
            let mut buf = Vec::new();
            data.read_to_end(&mut buf)
                .map_err(|e| FtpFailure::Permanent(e.to_string()))?;
            self.0.files.lock().unwrap().insert(remote_path.to_string(), buf);
            Ok(())
        }

        fn get(&mut self, remote_path: &str, out: &mut dyn Write) -> FtpResult<()> {
            let data = self
                .0
                .file(remote_path)
                .ok_or_else(|| FtpFailure::Permanent(format!("550 {} not found", remote_path)))?;
            out.write_all(&data)
                .map_err(|e| FtpFailure::Transient(e.to_string()))
        }

        fn delete(&mut self, remote_path: &str) -> FtpResult<()> {
            self.0.files.lock().unwrap().remove(remote_path);
            Ok(())
        }

        fn quit(&mut self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeConnector, FakeFtp};
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn target() -> FtpTarget {
        FtpTarget {
            host: "192.168.1.100".to_string(),
            port: 21,
            username: "backup".to_string(),
            password: "secret".to_string(),
            path: "/backup/db/".to_string(),
            passive: true,
        }
    }

    fn quick_settings() -> FtpSettings {
        FtpSettings {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            ..FtpSettings::default()
        }
    }

    fn sink(server: &Arc<FakeFtp>) -> FtpSink {
        FtpSink::new(
            "d3",
            &target(),
            &quick_settings(),
            Arc::new(FakeConnector(Arc::clone(server))),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_parent_dirs_keep_relative_roots_relative() {
        assert_eq!(
            parent_dirs("backup/db/a.sql"),
            vec!["backup".to_string(), "backup/db".to_string()]
        );
        assert!(parent_dirs("a.sql").is_empty());
    }

    #[test]
    fn test_parent_dirs_for_absolute_roots() {
        assert_eq!(
            parent_dirs("/srv/backup//db/a.sql"),
            vec!["/srv".to_string(), "/srv/backup".to_string(), "/srv/backup/db".to_string()]
        );
        assert!(parent_dirs("/a.sql").is_empty());
    }

    #[test]
    fn test_store_reuses_one_session() {
        let server = Arc::new(FakeFtp::default());
        let staging = TempDir::new().unwrap();
        let staged = staging.path().join("obj");
        fs::write(&staged, b"dump").unwrap();

        let mut sink = sink(&server);
        sink.preflight(4).unwrap();
        sink.store("db/a.sql", &staged).unwrap();
        sink.store("db/b.sql", &staged).unwrap();
        sink.close();

        assert_eq!(server.file("/backup/db/db/a.sql").unwrap(), b"dump");
        assert!(server.file("/backup/db/db/b.sql").is_some());
        assert_eq!(*server.connects.lock().unwrap(), 1);
    }

    #[test]
    fn test_transient_connect_failures_are_retried() {
        let server = Arc::new(FakeFtp::default());
        *server.failing_connects.lock().unwrap() = 2;

        let mut sink = sink(&server);
        sink.preflight(0).unwrap();
        assert_eq!(*server.connects.lock().unwrap(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let server = Arc::new(FakeFtp::default());
        *server.failing_connects.lock().unwrap() = 10;

        let mut sink = sink(&server);
        match sink.preflight(0) {
            Err(BackupError::DestinationUnreachable { reason, .. }) => {
                assert!(reason.contains("3 attempt"), "{}", reason)
            }
            other => panic!("expected DestinationUnreachable, got {:?}", other),
        }
        assert_eq!(*server.connects.lock().unwrap(), 3);
    }

    #[test]
    fn test_permanent_failure_is_not_retried() {
        let server = Arc::new(FakeFtp {
            refuse_login: true,
            ..FakeFtp::default()
        });
        let mut sink = sink(&server);
        assert!(sink.preflight(0).is_err());
        assert_eq!(*server.connects.lock().unwrap(), 1);
    }

    #[test]
    fn test_dropped_upload_reconnects() {
        let server = Arc::new(FakeFtp::default());
        *server.failing_puts.lock().unwrap() = 1;
        let staging = TempDir::new().unwrap();
        let staged = staging.path().join("obj");
        fs::write(&staged, b"retry me").unwrap();

        let mut sink = sink(&server);
        sink.preflight(0).unwrap();
        sink.store("x.bin", &staged).unwrap();

        assert_eq!(server.file("/backup/db/x.bin").unwrap(), b"retry me");
        assert_eq!(*server.connects.lock().unwrap(), 2);
        assert_eq!(
            sink.stored_hash("x.bin").unwrap(),
            crate::service::hash::hash_file(&staged).unwrap()
        );
    }

    #[test]
    fn test_cancel_interrupts_backoff() {
        let server = Arc::new(FakeFtp::default());
        *server.failing_connects.lock().unwrap() = 10;
        let cancel = Arc::new(AtomicBool::new(true));
        let settings = FtpSettings {
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            ..quick_settings()
        };
        let mut sink = FtpSink::new(
            "d3",
            &target(),
            &settings,
            Arc::new(FakeConnector(Arc::clone(&server))),
            cancel,
        );

        let started = Instant::now();
        assert!(matches!(sink.preflight(0), Err(BackupError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
