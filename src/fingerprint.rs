//! Content fingerprints
//!
//! A [`ContentFingerprint`] is the `(length, digest)` pair used to decide whether
//! two files carry the same bytes. The digest is XXH3-128, a fast
//! non-cryptographic hash; collisions are possible but treated as negligible.
//! Callers that cannot accept that risk enable byte-for-byte verification of
//! candidate matches in the engine.
//!
//! ## Sampling policy
//!
//! [`FingerprintPolicy::Full`] hashes every byte and is the default.
//!
//! [`FingerprintPolicy::Sampled`] bounds the cost for very large files. Files
//! at or below `threshold` bytes are still hashed in full. Larger files hash
//! their length (little-endian) followed by [`SAMPLE_WINDOWS`] windows of
//! `window` bytes each, at offsets `i * (length - window) / (SAMPLE_WINDOWS - 1)`.
//! The first window starts at byte 0 and the last one ends at EOF. The policy
//! is recorded in each session's metadata, because fingerprints produced under
//! different policies are not comparable.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use xxhash_rust::xxh3::Xxh3;

/// Number of windows hashed under [`FingerprintPolicy::Sampled`]
pub const SAMPLE_WINDOWS: u64 = 16;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 128-bit content digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; 16]);

impl Digest {
    /// Build a digest from the raw XXH3-128 output
    pub fn from_u128(value: u128) -> Self {
        Digest(value.to_be_bytes())
    }

    /// Lowercase hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 32-character hex string
    pub fn from_hex(text: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(text, &mut bytes)?;
        Ok(Digest(bytes))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Digest::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Equivalence key for file content
///
/// Two files are considered to carry the same content iff both `length` and
/// `digest` are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentFingerprint {
    /// File length in bytes
    pub length: u64,
    /// XXH3-128 digest of the content (or of the sampled windows)
    pub digest: Digest,
}

impl ContentFingerprint {
    /// Fingerprint an in-memory buffer under the full policy
    pub fn of_bytes(data: &[u8]) -> Self {
        Self {
            length: data.len() as u64,
            digest: Digest::from_u128(xxhash_rust::xxh3::xxh3_128(data)),
        }
    }

    /// Short form for log lines
    pub fn short(&self) -> String {
        format!("{}:{}", self.length, &self.digest.to_hex()[..12])
    }
}

/// How much of a file contributes to its digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FingerprintPolicy {
    /// Hash every byte
    #[default]
    Full,
    /// Hash fixed windows of files larger than `threshold`
    Sampled {
        /// Files up to this size are hashed fully
        threshold: u64,
        /// Size of each sampled window in bytes
        window: u64,
    },
}

impl FingerprintPolicy {
    /// Sampling with a 64 MiB threshold and 1 MiB windows
    pub fn sampled_default() -> Self {
        FingerprintPolicy::Sampled {
            threshold: 64 * 1024 * 1024,
            window: 1024 * 1024,
        }
    }

    /// Window size if a file of `length` bytes is sampled, `None` if it is hashed fully
    pub fn sample_window(&self, length: u64) -> Option<u64> {
        match *self {
            FingerprintPolicy::Sampled { threshold, window } if length > threshold && window > 0 => {
                Some(window)
            }
            _ => None,
        }
    }
}

/// Compute the fingerprint of the file at `path`
pub fn fingerprint_file(path: &Path, policy: FingerprintPolicy) -> io::Result<ContentFingerprint> {
    let mut file = File::open(path)?;
    let length = file.metadata()?.len();
    match policy.sample_window(length) {
        Some(window) => fingerprint_sampled(&mut file, length, window),
        None => fingerprint_reader(file),
    }
}

/// Hash a stream in full; the length is the number of bytes actually read
pub fn fingerprint_reader<R: Read>(reader: R) -> io::Result<ContentFingerprint> {
    let mut hashing = HashingReader::new(BufReader::with_capacity(READ_BUFFER_SIZE, reader));
    io::copy(&mut hashing, &mut io::sink())?;
    Ok(hashing.fingerprint())
}

/// Hash the sampled windows of a seekable stream holding `length` bytes
pub fn fingerprint_sampled<R: Read + Seek>(
    reader: &mut R,
    length: u64,
    window: u64,
) -> io::Result<ContentFingerprint> {
    let window = window.min(length);
    let mut hasher = Xxh3::new();
    hasher.update(&length.to_le_bytes());

    let mut buffer = vec![0u8; window as usize];
    let span = length - window;
    for i in 0..SAMPLE_WINDOWS {
        let offset = i * span / (SAMPLE_WINDOWS - 1);
        reader.seek(SeekFrom::Start(offset))?;
        reader.read_exact(&mut buffer)?;
        hasher.update(&buffer);
    }

    Ok(ContentFingerprint {
        length,
        digest: Digest::from_u128(hasher.digest128()),
    })
}

/// Reader adapter that hashes and counts every byte passing through it
///
/// Lets a copy or archive step learn the full-policy fingerprint of exactly
/// the bytes it wrote, without reading the source twice.
pub struct HashingReader<R> {
    inner: R,
    hasher: Xxh3,
    length: u64,
}

impl<R: Read> HashingReader<R> {
    /// Wrap `inner`
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Xxh3::new(),
            length: 0,
        }
    }

    /// Bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.length
    }

    /// Full-policy fingerprint of the bytes read so far
    pub fn fingerprint(&self) -> ContentFingerprint {
        ContentFingerprint {
            length: self.length,
            digest: Digest::from_u128(self.hasher.digest128()),
        }
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        self.length += read as u64;
        Ok(read)
    }
}

/// Per-file working state for one run
///
/// The fingerprint is computed lazily and at most once, then cached.
#[derive(Debug)]
pub struct SourceFileHandle {
    /// Path the bytes are read from (snapshot-mapped when a snapshot is active)
    pub source_path: PathBuf,
    /// Path relative to the source root, `/`-separated
    pub relative_path: String,
    /// Length observed during enumeration
    pub length: u64,
    fingerprint: OnceLock<ContentFingerprint>,
}

impl SourceFileHandle {
    /// Create a handle with no fingerprint computed yet
    pub fn new(source_path: PathBuf, relative_path: String, length: u64) -> Self {
        Self {
            source_path,
            relative_path,
            length,
            fingerprint: OnceLock::new(),
        }
    }

    /// Get the fingerprint, computing it on first use
    pub fn fingerprint(&self, policy: FingerprintPolicy) -> io::Result<ContentFingerprint> {
        if let Some(fp) = self.fingerprint.get() {
            return Ok(*fp);
        }
        let computed = fingerprint_file(&self.source_path, policy)?;
        Ok(*self.fingerprint.get_or_init(|| computed))
    }

    /// The fingerprint if it has already been computed
    pub fn cached_fingerprint(&self) -> Option<&ContentFingerprint> {
        self.fingerprint.get()
    }
}
