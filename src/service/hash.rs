use crate::models::error::{BackupError, Result};
use blake2::{Blake2b512, Digest};
use std::fs;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

pub fn hash_file(file: &Path) -> Result<String> {
    let reader = fs::File::open(file)
        .map(BufReader::new)
        .map_err(|cause| BackupError::HashError {
            path: file.to_path_buf(),
            cause,
        })?;
    hasher(reader).map_err(|cause| BackupError::HashError {
        path: file.to_path_buf(),
        cause,
    })
}

pub fn hasher<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Blake2b512::new();
    let mut buffer = [0; 8192];
    loop {
        let count = reader.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Pass-through writer that hashes everything written to it.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Blake2b512,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Blake2b512::new(),
            written: 0,
        }
    }

    /// Returns the wrapped writer, the hex digest and the byte count.
    pub fn finish(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.hasher.update(&buf[..count]);
        self.written += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
