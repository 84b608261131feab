//! SHA-256 content hashes used as cache keys

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

const HASH_LEN: usize = 32;
const READ_CHUNK: usize = 64 * 1024;

/// A SHA-256 digest of some content, rendered as lowercase hex
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; HASH_LEN]);

/// Key of an entry in the cache.
///
/// Manifest keys are chosen by the caller, content keys are file content hashes.
pub type CacheKey = ContentHash;

impl ContentHash {
    /// All-zero hash, recorded for entries that have no content
    pub const ZERO: Self = Self([0; HASH_LEN]);

    /// Hash an in-memory buffer
    #[must_use]
    pub fn from_data(data: &[u8]) -> Self {
        Self::from_digest(&Sha256::digest(data)[..])
    }

    /// Hash a stream, returning the hash and the number of bytes read
    pub fn from_reader(reader: &mut impl Read) -> io::Result<(Self, u64)> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut total: u64 = 0;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        Ok((Self::from_digest(&hasher.finalize()[..]), total))
    }

    fn from_digest(digest: &[u8]) -> Self {
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(digest);
        Self(bytes)
    }

    /// Parse from a 64 character hex string
    ///
    /// # Errors
    ///
    /// Returns error if the hex string is invalid or wrong length
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != HASH_LEN * 2 {
            return Err(Error::invalid_hash(format!(
                "expected {} hex characters, got {}",
                HASH_LEN * 2,
                hex.len()
            )));
        }
        let mut bytes = [0u8; HASH_LEN];
        hex::decode_to_slice(hex, &mut bytes)
            .map_err(|e| Error::invalid_hash(format!("'{hex}': {e}")))?;
        Ok(Self(bytes))
    }

    /// Raw digest bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Lowercase hex representation
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Incremental hasher producing a [`ContentHash`]
#[derive(Clone, Default)]
pub struct ContentHasher(Sha256);

impl ContentHasher {
    /// Create an empty hasher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes
    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.0.update(data.as_ref());
    }

    /// Feed another hash
    pub fn update_hash(&mut self, hash: &ContentHash) {
        self.0.update(hash.as_bytes());
    }

    /// Consume the hasher
    #[must_use]
    pub fn finish(self) -> ContentHash {
        ContentHash::from_digest(&self.0.finalize()[..])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.to_hex()
    }
}
