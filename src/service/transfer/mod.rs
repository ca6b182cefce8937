pub mod capture;
pub mod codec;
pub mod ftp;
pub mod local;

use crate::models::config::EngineConfig;
use crate::models::destination::{Destination, Target};
use crate::models::error::{BackupError, FailureKind, Result};
use crate::models::run_record::FileIssue;
use crate::models::task::Task;
use crate::service::change_detector::CandidateFile;
use crate::service::hash::HashingWriter;
use crate::utils::format::format_bytes;
use capture::{SnapshotCapture, StagedCopyCapture};
use codec::{EncodedWriter, Encoding, EnvPasswordSource, PasswordSource};
use ftp::{FtpConnector, FtpSink, SuppaftpConnector};
use local::{LocalSink, SpaceProbe, SysinfoSpaceProbe};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

/// Where encoded objects end up. Object names are `/`-separated and
/// relative to the destination root.
pub trait DestinationSink: Send {
    /// Check the destination can take `pending_bytes` before anything is
    /// written. An error here fails the whole destination.
    fn preflight(&mut self, pending_bytes: u64) -> Result<()>;

    /// Atomically place the staged file under `name`.
    fn store(&mut self, name: &str, staged: &Path) -> Result<()>;

    /// Read the stored object back and return its BLAKE2b digest.
    fn stored_hash(&mut self, name: &str) -> Result<String>;

    fn remove(&mut self, name: &str) -> Result<()>;

    fn close(&mut self) {}
}

/// Pluggable collaborators of the transfer engine.
#[derive(Clone)]
pub struct TransferDeps {
    pub space: Arc<dyn SpaceProbe>,
    pub ftp: Arc<dyn FtpConnector>,
    pub capture: Arc<dyn SnapshotCapture>,
    pub passwords: Arc<dyn PasswordSource>,
}

impl TransferDeps {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            space: Arc::new(SysinfoSpaceProbe),
            ftp: Arc::new(SuppaftpConnector),
            capture: Arc::new(StagedCopyCapture),
            passwords: Arc::new(EnvPasswordSource::new(&config.encryption_password_env)),
        }
    }
}

pub fn open_sink(
    destination: &Destination,
    deps: &TransferDeps,
    config: &EngineConfig,
    cancel: Arc<AtomicBool>,
) -> Box<dyn DestinationSink> {
    let label = destination.label();
    match &destination.target {
        Target::Local { path } | Target::Network { path } => Box::new(LocalSink::new(
            &label,
            path,
            Arc::clone(&deps.space),
            config.free_space_margin_bytes,
        )),
        Target::Ftp(target) => Box::new(FtpSink::new(
            &label,
            target,
            &config.ftp,
            Arc::clone(&deps.ftp),
            cancel,
        )),
    }
}

/// Everything one run hands to each destination.
pub struct TransferJob<'a> {
    pub files: &'a [CandidateFile],
    pub encoding: Encoding<'a>,
    /// Prefix of versioned output, `<task-slug>/<YYYYMMDD-HHMMSS>`.
    pub version: Option<(String, String)>,
    pub archive: bool,
    pub verify: bool,
    pub integrity_retries: u32,
    pub staging: &'a Path,
    pub cancel: &'a AtomicBool,
}

impl<'a> TransferJob<'a> {
    pub fn new(
        task: &Task,
        files: &'a [CandidateFile],
        password: Option<&'a str>,
        stamp: &str,
        staging: &'a Path,
        integrity_retries: u32,
        cancel: &'a AtomicBool,
    ) -> Self {
        let options = &task.options;
        let encrypt = if options.encryption {
            password.map(|p| (options.encryption_method, p))
        } else {
            None
        };
        Self {
            files,
            encoding: Encoding {
                compress: options.compression,
                encrypt,
            },
            version: options
                .create_versioned_backups
                .then(|| (task.slug(), stamp.to_string())),
            archive: options.writes_archive(),
            verify: options.verify_checksum,
            integrity_retries,
            staging,
            cancel,
        }
    }

    pub fn object_name(&self, key: &str) -> String {
        let suffix = self.encoding.suffix();
        match &self.version {
            Some((slug, stamp)) => format!("{}/{}/{}{}", slug, stamp, key, suffix),
            None => format!("{}{}", key, suffix),
        }
    }

    pub fn archive_name(&self) -> String {
        let encrypted = if self.encoding.encrypt.is_some() { ".enc" } else { "" };
        match &self.version {
            Some((slug, stamp)) => format!("{}/{}.tar.gz{}", slug, stamp, encrypted),
            None => format!("backup.tar.gz{}", encrypted),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn pending_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.entry.size).sum()
    }
}

/// Outcome of a run against one destination.
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub destination_id: String,
    /// Keys of files stored (and verified when requested).
    pub succeeded: Vec<String>,
    pub skipped: Vec<FileIssue>,
    pub failed: Vec<FileIssue>,
    pub bytes_written: u64,
    pub duration: Duration,
    /// Set when the destination failed as a whole.
    pub fatal: Option<FileIssue>,
}

impl TransferResult {
    fn new(destination_id: &str) -> Self {
        Self {
            destination_id: destination_id.to_string(),
            succeeded: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            bytes_written: 0,
            duration: Duration::ZERO,
            fatal: None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    fn issue(&self, path: &str, error: &BackupError) -> FileIssue {
        FileIssue {
            path: path.to_string(),
            destination: Some(self.destination_id.clone()),
            kind: error.kind(),
            reason: error.to_string(),
        }
    }

    fn skip(&mut self, path: &str, error: &BackupError) {
        let issue = self.issue(path, error);
        self.skipped.push(issue);
    }

    fn fail(&mut self, path: &str, error: &BackupError) {
        let issue = self.issue(path, error);
        self.failed.push(issue);
    }
}

/// Copy the job's files to one destination.
///
/// Never returns an error: destination-level problems end up in
/// [`TransferResult::fatal`], per-file ones in `skipped` / `failed`.
pub fn transfer(job: &TransferJob<'_>, destination_id: &str, sink: &mut dyn DestinationSink) -> TransferResult {
    let started = Instant::now();
    let mut result = TransferResult::new(destination_id);

    if let Err(e) = sink.preflight(job.pending_bytes()) {
        warn!("Destination {} failed pre-flight: {}", destination_id, e);
        result.fatal = Some(result.issue(destination_id, &e));
        result.duration = started.elapsed();
        return result;
    }

    if job.archive {
        transfer_archive(job, sink, &mut result);
    } else {
        transfer_files(job, sink, &mut result);
    }
    sink.close();

    result.duration = started.elapsed();
    info!(
        "Destination {}: {} stored, {} skipped, {} failed, {} written",
        destination_id,
        result.succeeded.len(),
        result.skipped.len(),
        result.failed.len(),
        format_bytes(result.bytes_written)
    );
    result
}

fn skip_remaining(files: &[CandidateFile], result: &mut TransferResult) {
    for file in files {
        result.skip(file.key(), &BackupError::Cancelled);
    }
}

fn open_source(file: &CandidateFile) -> Result<File> {
    File::open(&file.path).map_err(|e| BackupError::SourceUnavailable {
        path: file.path.clone(),
        reason: e.to_string(),
    })
}

/// Encode `source` into a new staging file; returns it with the digest and
/// size of the encoded bytes.
fn encode_to_staging<R: Read>(
    source: &mut R,
    job: &TransferJob<'_>,
) -> Result<(NamedTempFile, String, u64)> {
    let staged = NamedTempFile::new_in(job.staging)?;
    let hashing = HashingWriter::new(BufWriter::new(staged.as_file().try_clone()?));
    let mut encoded = EncodedWriter::new(hashing, &job.encoding)?;
    io::copy(source, &mut encoded)?;
    let (mut out, digest, written) = encoded.finish()?.finish();
    out.flush()?;
    Ok((staged, digest, written))
}

/// Store and, when verification is on, read back until the digests match
/// or the retries run out.
fn store_verified(
    job: &TransferJob<'_>,
    sink: &mut dyn DestinationSink,
    name: &str,
    staged: &Path,
    digest: &str,
) -> Result<()> {
    let attempts = job.integrity_retries + 1;
    for attempt in 1..=attempts {
        sink.store(name, staged)?;
        if !job.verify {
            return Ok(());
        }
        let stored = sink.stored_hash(name)?;
        if stored == digest {
            debug!("Verified {}", name);
            return Ok(());
        }
        warn!(
            "Checksum mismatch for {} (attempt {}/{})",
            name, attempt, attempts
        );
        sink.remove(name)?;
    }
    Err(BackupError::Integrity {
        path: name.to_string(),
        attempts,
    })
}

fn transfer_files(job: &TransferJob<'_>, sink: &mut dyn DestinationSink, result: &mut TransferResult) {
    for (index, file) in job.files.iter().enumerate() {
        if job.cancelled() {
            skip_remaining(&job.files[index..], result);
            return;
        }

        let mut source = match open_source(file) {
            Ok(source) => source,
            Err(e) => {
                warn!("Skipping {}: {}", file.path.display(), e);
                result.skip(file.key(), &e);
                continue;
            }
        };

        let name = job.object_name(file.key());
        let outcome = encode_to_staging(&mut source, job).and_then(|(staged, digest, written)| {
            store_verified(job, sink, &name, staged.path(), &digest)?;
            Ok(written)
        });

        match outcome {
            Ok(written) => {
                result.bytes_written += written;
                result.succeeded.push(file.key().to_string());
            }
            Err(BackupError::Cancelled) => {
                skip_remaining(&job.files[index..], result);
                return;
            }
            Err(e) => {
                warn!("Failed to copy {} to {}: {}", file.key(), result.destination_id, e);
                result.fail(file.key(), &e);
            }
        }
    }
}

fn transfer_archive(job: &TransferJob<'_>, sink: &mut dyn DestinationSink, result: &mut TransferResult) {
    let name = job.archive_name();
    let mut included = Vec::new();

    let built = build_archive(job, result, &mut included);
    let outcome = built.and_then(|(staged, digest, written)| {
        if included.is_empty() {
            return Ok(0);
        }
        store_verified(job, sink, &name, staged.path(), &digest)?;
        Ok(written)
    });

    match outcome {
        Ok(written) => {
            result.bytes_written += written;
            result.succeeded.extend(included);
        }
        Err(BackupError::Cancelled) => {
            for key in &included {
                result.skip(key, &BackupError::Cancelled);
            }
        }
        Err(e) => {
            warn!("Failed to write archive {} to {}: {}", name, result.destination_id, e);
            for key in &included {
                result.fail(key, &e);
            }
        }
    }
}

fn build_archive(
    job: &TransferJob<'_>,
    result: &mut TransferResult,
    included: &mut Vec<String>,
) -> Result<(NamedTempFile, String, u64)> {
    let start = || -> Result<_> {
        let staged = NamedTempFile::new_in(job.staging)?;
        let hashing = HashingWriter::new(BufWriter::new(staged.as_file().try_clone()?));
        let encoding = Encoding {
            compress: true,
            ..job.encoding
        };
        let builder = tar::Builder::new(EncodedWriter::new(hashing, &encoding)?);
        Ok((staged, builder))
    };
    let (staged, mut builder) = match start() {
        Ok(started) => started,
        Err(e) => {
            // Nothing was written; every file in the run fails with the staging error.
            included.extend(job.files.iter().map(|f| f.key().to_string()));
            return Err(e);
        }
    };

    for (index, file) in job.files.iter().enumerate() {
        if job.cancelled() {
            skip_remaining(&job.files[index..], result);
            break;
        }
        let mut source = match open_source(file) {
            Ok(source) => source,
            Err(e) => {
                warn!("Skipping {}: {}", file.path.display(), e);
                result.skip(file.key(), &e);
                continue;
            }
        };
        included.push(file.key().to_string());
        if let Err(e) = builder.append_file(file.key(), &mut source) {
            // The archive is unusable from here on; fail everything in it.
            included.extend(job.files[index + 1..].iter().map(|f| f.key().to_string()));
            return Err(e.into());
        }
    }

    let (mut out, digest, written) = builder.into_inner()?.finish()?.finish();
    out.flush()?;
    Ok((staged, digest, written))
}

/// Files dropped from a run before transfer, with why.
pub fn skipped_for(kind: FailureKind, path: &str, reason: String) -> FileIssue {
    FileIssue {
        path: path.to_string(),
        destination: None,
        kind,
        reason,
    }
}
