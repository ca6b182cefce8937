use crate::models::error::{BackupError, Result};
use crate::models::task::EncryptionMethod;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;
use std::io::{self, Read, Write};

/// Container magic for encrypted backup objects.
const MAGIC: &[u8; 4] = b"RBE2";
/// Plaintext bytes per encrypted chunk.
pub const CHUNK_SIZE: usize = 1024 * 1024;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const FINAL_CHUNK_FLAG: u8 = 0x80;
const KDF_PARAMS_LEN: usize = 12;
const HEADER_LEN: usize = 4 + 1 + KDF_PARAMS_LEN + SALT_LEN + NONCE_LEN;
/// Upper bound accepted from a container header (1 GiB).
const MAX_KDF_MEMORY_KIB: u32 = 1024 * 1024;

/// Argon2id cost parameters, stored in every container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub lanes: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        if cfg!(test) {
            Self {
                memory_kib: 64,
                iterations: 1,
                lanes: 1,
            }
        } else {
            Self {
                memory_kib: 19 * 1024,
                iterations: 2,
                lanes: 1,
            }
        }
    }
}

impl KdfParams {
    fn to_bytes(self) -> [u8; KDF_PARAMS_LEN] {
        let mut bytes = [0u8; KDF_PARAMS_LEN];
        bytes[..4].copy_from_slice(&self.memory_kib.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.iterations.to_le_bytes());
        bytes[8..].copy_from_slice(&self.lanes.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            memory_kib: word(0),
            iterations: word(4),
            lanes: word(8),
        }
    }

    fn derive_key(&self, password: &str, salt: &[u8], key: &mut [u8]) -> Result<()> {
        if self.memory_kib > MAX_KDF_MEMORY_KIB {
            return Err(BackupError::Encryption(format!(
                "key derivation memory {} KiB exceeds the limit",
                self.memory_kib
            )));
        }
        let params = Params::new(self.memory_kib, self.iterations, self.lanes, Some(key.len()))
            .map_err(|e| BackupError::Encryption(format!("invalid key derivation parameters: {}", e)))?;
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(password.as_bytes(), salt, key)
            .map_err(|e| BackupError::Encryption(format!("key derivation failed: {}", e)))
    }
}

/// Supplies the encryption password out of band.
pub trait PasswordSource: Send + Sync {
    fn password(&self) -> Result<String>;
}

/// Reads the password from an environment variable.
pub struct EnvPasswordSource {
    pub variable: String,
}

impl EnvPasswordSource {
    pub fn new(variable: &str) -> Self {
        Self {
            variable: variable.to_string(),
        }
    }
}

impl PasswordSource for EnvPasswordSource {
    fn password(&self) -> Result<String> {
        match std::env::var(&self.variable) {
            Ok(password) if !password.is_empty() => Ok(password),
            _ => Err(BackupError::Encryption(format!(
                "no encryption password set in environment variable {}",
                self.variable
            ))),
        }
    }
}

/// A password known up front, e.g. handed over by an embedding application.
pub struct FixedPassword(pub String);

impl PasswordSource for FixedPassword {
    fn password(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

fn algorithm_byte(method: EncryptionMethod) -> u8 {
    match method {
        EncryptionMethod::Aes128 => 1,
        EncryptionMethod::Aes256 => 2,
    }
}

fn method_from_byte(byte: u8) -> Option<EncryptionMethod> {
    match byte {
        1 => Some(EncryptionMethod::Aes128),
        2 => Some(EncryptionMethod::Aes256),
        _ => None,
    }
}

enum Cipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl Cipher {
    fn new(method: EncryptionMethod, password: &str, salt: &[u8], kdf: &KdfParams) -> Result<Self> {
        let mut key = vec![0u8; method.key_len()];
        kdf.derive_key(password, salt, &mut key)?;
        let key = key.as_slice();

        let invalid = |_| BackupError::Encryption("invalid key length".to_string());
        Ok(match method {
            EncryptionMethod::Aes128 => Cipher::Aes128(Box::new(Aes128Gcm::new_from_slice(key).map_err(invalid)?)),
            EncryptionMethod::Aes256 => Cipher::Aes256(Box::new(Aes256Gcm::new_from_slice(key).map_err(invalid)?)),
        })
    }

    fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let sealed = match self {
            Cipher::Aes128(c) => c.encrypt(nonce, plaintext),
            Cipher::Aes256(c) => c.encrypt(nonce, plaintext),
        };
        sealed.map_err(|e| io::Error::other(format!("chunk encryption failed: {}", e)))
    }

    fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let opened = match self {
            Cipher::Aes128(c) => c.decrypt(nonce, ciphertext),
            Cipher::Aes256(c) => c.decrypt(nonce, ciphertext),
        };
        opened.map_err(|_| {
            BackupError::Encryption("authentication failed (wrong password or corrupted data)".to_string())
        })
    }
}

fn chunk_nonce(base: &[u8; NONCE_LEN], index: u64, last: bool) -> [u8; NONCE_LEN] {
    let mut nonce = *base;
    for (slot, byte) in nonce[4..].iter_mut().zip(index.to_be_bytes()) {
        *slot ^= byte;
    }
    if last {
        nonce[0] ^= FINAL_CHUNK_FLAG;
    }
    nonce
}

/// Streaming AES-GCM encryptor. Plaintext is sealed in `CHUNK_SIZE` pieces,
/// each written as `[u32 length][ciphertext]`; the last chunk uses a
/// distinct nonce so truncation is detected on decryption.
pub struct ChunkedEncryptor<W: Write> {
    inner: W,
    cipher: Cipher,
    base_nonce: [u8; NONCE_LEN],
    buffer: Vec<u8>,
    index: u64,
}

impl<W: Write> ChunkedEncryptor<W> {
    pub fn new(inner: W, method: EncryptionMethod, password: &str) -> Result<Self> {
        Self::with_params(inner, method, password, KdfParams::default())
    }

    pub fn with_params(mut inner: W, method: EncryptionMethod, password: &str, kdf: KdfParams) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        let mut base_nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut base_nonce);

        let cipher = Cipher::new(method, password, &salt, &kdf)?;

        inner.write_all(MAGIC)?;
        inner.write_all(&[algorithm_byte(method)])?;
        inner.write_all(&kdf.to_bytes())?;
        inner.write_all(&salt)?;
        inner.write_all(&base_nonce)?;

        Ok(Self {
            inner,
            cipher,
            base_nonce,
            buffer: Vec::with_capacity(CHUNK_SIZE),
            index: 0,
        })
    }

    fn write_chunk(&mut self, last: bool) -> io::Result<()> {
        let nonce = chunk_nonce(&self.base_nonce, self.index, last);
        let sealed = self.cipher.seal(&nonce, &self.buffer)?;
        self.inner.write_all(&(sealed.len() as u32).to_le_bytes())?;
        self.inner.write_all(&sealed)?;
        self.buffer.clear();
        self.index += 1;
        Ok(())
    }

    /// Seal the remaining plaintext as the final chunk.
    pub fn finish(mut self) -> io::Result<W> {
        self.write_chunk(true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ChunkedEncryptor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A full buffer is only sealed once more data arrives, so the
        // final chunk is never empty unless the whole stream is.
        if self.buffer.len() == CHUNK_SIZE {
            self.write_chunk(false)?;
        }
        let room = CHUNK_SIZE - self.buffer.len();
        let count = room.min(buf.len());
        self.buffer.extend_from_slice(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let count = reader.read(&mut buf[filled..])?;
        if count == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated chunk header"));
        }
        filled += count;
    }
    Ok(true)
}

/// Decrypt a container produced by [`ChunkedEncryptor`] into `writer`.
pub fn decrypt_stream<R: Read, W: Write>(mut reader: R, mut writer: W, password: &str) -> Result<u64> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    if &header[..4] != MAGIC {
        return Err(BackupError::Encryption("not an encrypted backup object".to_string()));
    }
    let method = method_from_byte(header[4])
        .ok_or_else(|| BackupError::Encryption(format!("unknown algorithm {}", header[4])))?;
    let kdf = KdfParams::from_bytes(&header[5..5 + KDF_PARAMS_LEN]);
    let salt_at = 5 + KDF_PARAMS_LEN;
    let salt = &header[salt_at..salt_at + SALT_LEN];
    let mut base_nonce = [0u8; NONCE_LEN];
    base_nonce.copy_from_slice(&header[salt_at + SALT_LEN..]);
    let cipher = Cipher::new(method, password, salt, &kdf)?;

    let mut index = 0u64;
    let mut written = 0u64;
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(&mut reader, &mut len_buf)? {
        return Err(BackupError::Encryption("missing final chunk".to_string()));
    }

    loop {
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut sealed = vec![0u8; len];
        reader.read_exact(&mut sealed)?;

        let last = !read_exact_or_eof(&mut reader, &mut len_buf)?;
        let plain = cipher.open(&chunk_nonce(&base_nonce, index, last), &sealed)?;
        writer.write_all(&plain)?;
        written += plain.len() as u64;
        index += 1;

        if last {
            break;
        }
    }
    writer.flush()?;
    Ok(written)
}

/// How a stored object is encoded.
#[derive(Clone, Copy)]
pub struct Encoding<'a> {
    pub compress: bool,
    pub encrypt: Option<(EncryptionMethod, &'a str)>,
}

impl Encoding<'_> {
    /// Extension appended to per-file object names.
    pub fn suffix(&self) -> &'static str {
        match (self.compress, self.encrypt.is_some()) {
            (false, false) => "",
            (true, false) => ".gz",
            (false, true) => ".enc",
            (true, true) => ".gz.enc",
        }
    }
}

enum Stage<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Encrypted(ChunkedEncryptor<W>),
    GzipEncrypted(GzEncoder<ChunkedEncryptor<W>>),
}

/// Writer that compresses and/or encrypts into `W`. Call [`finish`] to
/// flush trailers; dropping it leaves the output incomplete.
///
/// [`finish`]: EncodedWriter::finish
pub struct EncodedWriter<W: Write> {
    stage: Stage<W>,
}

impl<W: Write> EncodedWriter<W> {
    pub fn new(inner: W, encoding: &Encoding<'_>) -> Result<Self> {
        let stage = match (encoding.compress, encoding.encrypt) {
            (false, None) => Stage::Plain(inner),
            (true, None) => Stage::Gzip(GzEncoder::new(inner, Compression::default())),
            (false, Some((method, password))) => {
                Stage::Encrypted(ChunkedEncryptor::new(inner, method, password)?)
            }
            (true, Some((method, password))) => Stage::GzipEncrypted(GzEncoder::new(
                ChunkedEncryptor::new(inner, method, password)?,
                Compression::default(),
            )),
        };
        Ok(Self { stage })
    }

    pub fn finish(self) -> io::Result<W> {
        match self.stage {
            Stage::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Stage::Gzip(gz) => gz.finish(),
            Stage::Encrypted(enc) => enc.finish(),
            Stage::GzipEncrypted(gz) => gz.finish()?.finish(),
        }
    }
}

impl<W: Write> Write for EncodedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.stage {
            Stage::Plain(w) => w.write(buf),
            Stage::Gzip(w) => w.write(buf),
            Stage::Encrypted(w) => w.write(buf),
            Stage::GzipEncrypted(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.stage {
            Stage::Plain(w) => w.flush(),
            Stage::Gzip(w) => w.flush(),
            Stage::Encrypted(w) => w.flush(),
            Stage::GzipEncrypted(w) => w.flush(),
        }
    }
}
