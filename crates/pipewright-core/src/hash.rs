//! Content and determinant hashes
//!
//! Two hash kinds are kept apart on purpose:
//! - [`FileHash`] is the SHA-256 of one artifact's bytes on disk.
//! - [`DeterminantHash`] fingerprints everything that decides whether an
//!   artifact is still valid (toolchain, upstream file hashes, settings).
//!
//! Both render as 64 lowercase hex characters wherever they are serialized.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::HashError;

const HASH_LEN: usize = 32;

fn to_hex(bytes: &[u8; HASH_LEN]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(s: &str) -> Result<[u8; HASH_LEN], HashError> {
    if s.len() != HASH_LEN * 2 || !s.is_ascii() {
        return Err(HashError::InvalidHex(s.to_string()));
    }

    let mut out = [0u8; HASH_LEN];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
            .map_err(|_| HashError::InvalidHex(s.to_string()))?;
    }
    Ok(out)
}

/// Content hash of a single file
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHash([u8; HASH_LEN]);

impl FileHash {
    /// Hash an in-memory buffer
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Hash the contents of a file, streaming it through the hasher
    pub fn of_file(path: &Path) -> Result<Self, HashError> {
        let unreadable = |source| HashError::Unreadable {
            path: path.to_path_buf(),
            source,
        };

        let mut file = File::open(path).map_err(unreadable)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(unreadable)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hasher.finalize().into()))
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

/// Fingerprint of every input that determines an artifact's validity
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeterminantHash([u8; HASH_LEN]);

impl DeterminantHash {
    /// Start a determinant from a toolchain fingerprint
    pub fn new(toolchain_hash: DeterminantHash) -> Self {
        toolchain_hash
    }

    /// Determinant seeded from arbitrary bytes
    pub fn from_seed(seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"seed:");
        hasher.update(seed);
        Self(hasher.finalize().into())
    }

    /// Fold a file hash into the determinant. Order matters.
    pub fn combine(self, file_hash: &FileHash) -> Self {
        self.chain(b"file:", file_hash.as_bytes())
    }

    /// Fold a string (a path, a setting, a template name) into the determinant
    pub fn combine_str(self, value: &str) -> Self {
        self.chain(b"str:", value.as_bytes())
    }

    /// Fold raw bytes into the determinant
    pub fn combine_bytes(self, value: &[u8]) -> Self {
        self.chain(b"bytes:", value)
    }

    fn chain(self, tag: &[u8], value: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(tag);
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value);
        Self(hasher.finalize().into())
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

macro_rules! hex_hash_impls {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&to_hex(&self.0))
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($ty), to_hex(&self.0))
            }
        }

        impl FromStr for $ty {
            type Err = HashError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                from_hex(s).map(Self)
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&to_hex(&self.0))
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_hash_impls!(FileHash);
hex_hash_impls!(DeterminantHash);
