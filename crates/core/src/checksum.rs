//! Streaming content checksums
//!
//! Hashes are computed while bytes pass through a transfer, never in a
//! second pass over the data. BLAKE3 is the default; MD5 is kept for
//! backends that report it natively (S3 ETags, GCS `md5Hash`, Azure
//! `Content-MD5`).

use std::fmt;
use std::path::Path;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};

/// Read buffer used when hashing local files
const HASH_BUFFER_SIZE: usize = 256 * 1024;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// BLAKE3 tree hash (fast, default)
    #[default]
    Blake3,
    /// MD5, for backend compatibility
    Md5,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Blake3 => write!(f, "blake3"),
            ChecksumAlgorithm::Md5 => write!(f, "md5"),
        }
    }
}

impl std::str::FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "blake3" => Ok(ChecksumAlgorithm::Blake3),
            "md5" => Ok(ChecksumAlgorithm::Md5),
            _ => Err(Error::Config(format!("Unknown checksum algorithm: {s}"))),
        }
    }
}

/// A computed or backend-reported content hash (lowercase hex)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub value: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into().to_lowercase(),
        }
    }

    /// Build an MD5 checksum from raw digest bytes (e.g. decoded base64)
    pub fn md5_from_bytes(bytes: &[u8]) -> Self {
        Self::new(ChecksumAlgorithm::Md5, hex::encode(bytes))
    }

    /// Interpret an S3-style ETag as MD5; multipart ETags (`…-N`) are not digests
    pub fn from_etag(etag: &str) -> Option<Self> {
        let etag = etag.trim_matches('"');
        if etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self::new(ChecksumAlgorithm::Md5, etag))
        } else {
            None
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

/// Outcome of comparing a computed hash against a reported one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Match,
    Mismatch { expected: Checksum, actual: Checksum },
    /// Nothing comparable was reported
    Unverified,
}

impl Verification {
    /// Convert a mismatch into an `IntegrityMismatch` error
    pub fn into_result(self, what: &str) -> Result<Verification> {
        match self {
            Verification::Mismatch { expected, actual } => Err(Error::IntegrityMismatch(format!(
                "{what}: expected {expected}, computed {actual}"
            ))),
            other => Ok(other),
        }
    }
}

enum HasherState {
    Blake3(Box<blake3::Hasher>),
    Md5(Md5),
}

/// Hashes a byte stream with one or more algorithms at once
pub struct MultiHasher {
    states: Vec<HasherState>,
    bytes: u64,
}

impl MultiHasher {
    /// Create a hasher for the given algorithms (duplicates are ignored)
    pub fn new(algorithms: &[ChecksumAlgorithm]) -> Self {
        let mut algorithms = algorithms.to_vec();
        algorithms.sort();
        algorithms.dedup();

        let states = algorithms
            .into_iter()
            .map(|a| match a {
                ChecksumAlgorithm::Blake3 => HasherState::Blake3(Box::new(blake3::Hasher::new())),
                ChecksumAlgorithm::Md5 => HasherState::Md5(Md5::new()),
            })
            .collect();

        Self { states, bytes: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        for state in &mut self.states {
            match state {
                HasherState::Blake3(h) => {
                    h.update(data);
                }
                HasherState::Md5(h) => h.update(data),
            }
        }
        self.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn algorithms(&self) -> Vec<ChecksumAlgorithm> {
        self.states
            .iter()
            .map(|s| match s {
                HasherState::Blake3(_) => ChecksumAlgorithm::Blake3,
                HasherState::Md5(_) => ChecksumAlgorithm::Md5,
            })
            .collect()
    }

    pub fn finalize(self) -> Digests {
        let values = self
            .states
            .into_iter()
            .map(|s| match s {
                HasherState::Blake3(h) => {
                    Checksum::new(ChecksumAlgorithm::Blake3, h.finalize().to_hex().to_string())
                }
                HasherState::Md5(h) => Checksum::md5_from_bytes(&h.finalize()),
            })
            .collect();
        Digests { values }
    }
}

impl fmt::Debug for MultiHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiHasher")
            .field("algorithms", &self.algorithms())
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// Tracks a hash over an offset-addressed stream
///
/// After a retry a stream may replay bytes that were already hashed; only
/// the part past the current offset is fed to the hasher.
#[derive(Debug)]
pub struct HashCursor {
    hasher: MultiHasher,
}

impl HashCursor {
    pub fn new(algorithms: &[ChecksumAlgorithm]) -> Self {
        Self {
            hasher: MultiHasher::new(algorithms),
        }
    }

    /// Offset up to which bytes have been hashed
    pub fn offset(&self) -> u64 {
        self.hasher.bytes_hashed()
    }

    /// Feed `data`, which starts at absolute `offset`
    ///
    /// Fails when the data would leave a gap in the hashed range.
    pub fn update_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let hashed = self.hasher.bytes_hashed();
        if offset > hashed {
            return Err(Error::General(format!(
                "checksum gap: data at offset {offset}, hashed up to {hashed}"
            )));
        }
        let skip = (hashed - offset) as usize;
        if skip < data.len() {
            self.hasher.update(&data[skip..]);
        }
        Ok(())
    }

    pub fn finalize(self) -> Digests {
        self.hasher.finalize()
    }
}

/// The set of checksums computed for one transfer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digests {
    pub values: Vec<Checksum>,
}

impl Digests {
    pub fn get(&self, algorithm: ChecksumAlgorithm) -> Option<&Checksum> {
        self.values.iter().find(|c| c.algorithm == algorithm)
    }

    /// Compare against a reported checksum of any supported algorithm
    pub fn verify(&self, reported: Option<&Checksum>) -> Verification {
        let Some(reported) = reported else {
            return Verification::Unverified;
        };
        match self.get(reported.algorithm) {
            Some(actual) if actual.value == reported.value => Verification::Match,
            Some(actual) => Verification::Mismatch {
                expected: reported.clone(),
                actual: actual.clone(),
            },
            None => Verification::Unverified,
        }
    }
}

/// Hash a local file without loading it into memory
pub async fn hash_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<Checksum> {
    let digests = hash_file_prefix(path, &[algorithm], u64::MAX).await?;
    digests
        .get(algorithm)
        .cloned()
        .ok_or_else(|| Error::General(format!("{algorithm} digest missing")))
}

/// Hash at most `limit` leading bytes of a local file
pub async fn hash_file_prefix(
    path: &Path,
    algorithms: &[ChecksumAlgorithm],
    limit: u64,
) -> Result<Digests> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = MultiHasher::new(algorithms);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut remaining = limit;

    while remaining > 0 {
        let want = remaining.min(buffer.len() as u64) as usize;
        let n = file.read(&mut buffer[..want]).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        remaining -= n as u64;
    }

    Ok(hasher.finalize())
}
