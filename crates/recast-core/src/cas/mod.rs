//! Content addressing for translations, stamps and workdir names.
//!
//! [`Digest`] fingerprints stage inputs so the scheduler can tell whether an
//! artifact is stale; [`fs::FsCasStore`] keeps snapshots of translated
//! sources so a rejected repair can be rolled back.

pub mod fs;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use thiserror::Error;

/// SHA-256 digest, rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn compute(data: &[u8]) -> Self {
        DigestBuilder::new().bytes(data).finish()
    }

    /// Digest of a file's contents; a missing file hashes to a fixed marker
    /// so that "absent" and "empty" stay distinguishable.
    pub fn of_file(path: &Path) -> Result<Self> {
        let mut builder = DigestBuilder::new();
        builder.file(path)?;
        Ok(builder.finish())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First twelve hex characters, used in directory and vector names.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl FromStr for Digest {
    type Err = CasError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CasError::InvalidDigest(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CasError::InvalidDigest(s.to_string()))?;
        Ok(Self(arr))
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental digest over several labelled parts.
///
/// Every part is length-prefixed, so `["ab", "c"]` and `["a", "bc"]` never
/// collide.
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.push(data);
        self
    }

    pub fn field(mut self, label: &str, value: &str) -> Self {
        self.push(label.as_bytes());
        self.push(value.as_bytes());
        self
    }

    pub fn push(&mut self, data: &[u8]) {
        self.hasher.update((data.len() as u64).to_le_bytes());
        self.hasher.update(data);
    }

    pub fn file(&mut self, path: &Path) -> Result<()> {
        match std::fs::read(path) {
            Ok(data) => {
                self.push(b"file");
                self.push(&data);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.push(b"absent"),
            Err(e) => return Err(CasError::Io(e)),
        }
        Ok(())
    }

    pub fn finish(self) -> Digest {
        let hash = self.hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Digest(bytes)
    }
}

impl Default for DigestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum CasError {
    #[error("blob not found: {0}")]
    NotFound(Digest),

    #[error("invalid digest hex: {0}")]
    InvalidDigest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Content-addressed blob storage.
pub trait CasStore: Send + Sync {
    /// Store `data` and return its digest. Storing the same bytes twice is a no-op.
    fn put(&self, data: &[u8]) -> Result<Digest>;

    fn get(&self, digest: &Digest) -> Result<Vec<u8>>;

    fn exists(&self, digest: &Digest) -> Result<bool>;
}
