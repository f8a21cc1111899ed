//! Toolchain fingerprinting
//!
//! Every determinant starts from the toolchain hash, so upgrading any binary
//! that feeds the pipeline invalidates every stashed artifact.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ToolChainError;
use crate::hash::{DeterminantHash, FileHash};

/// One binary participating in the build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolBinary {
    /// Location of the binary
    pub path: PathBuf,
    /// Content hash of the binary
    pub hash: FileHash,
}

/// The set of binaries in use for a run, plus their combined fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolChain {
    /// Tool version the binaries were built as
    pub version: semver::Version,
    /// Binaries by logical name (e.g. "compiler", "parser")
    pub binaries: BTreeMap<String, ToolBinary>,
    /// Combined fingerprint of version and every binary
    pub toolchain_hash: DeterminantHash,
}

impl ToolChain {
    /// Fingerprint a set of named binaries
    pub fn from_binaries<I, N, P>(version: semver::Version, binaries: I) -> Result<Self, ToolChainError>
    where
        I: IntoIterator<Item = (N, P)>,
        N: Into<String>,
        P: Into<PathBuf>,
    {
        let mut entries = BTreeMap::new();
        for (name, path) in binaries {
            let name = name.into();
            let path = path.into();
            let hash = FileHash::of_file(&path).map_err(|source| ToolChainError::Binary {
                name: name.clone(),
                source,
            })?;
            debug!(binary = %name, path = %path.display(), %hash, "fingerprinted toolchain binary");
            entries.insert(name, ToolBinary { path, hash });
        }

        let toolchain_hash = Self::compute_hash(&version, &entries);
        Ok(Self {
            version,
            binaries: entries,
            toolchain_hash,
        })
    }

    /// A toolchain with no binaries, fingerprinted only by version
    pub fn bare(version: semver::Version) -> Self {
        let binaries = BTreeMap::new();
        let toolchain_hash = Self::compute_hash(&version, &binaries);
        Self {
            version,
            binaries,
            toolchain_hash,
        }
    }

    fn compute_hash(version: &semver::Version, binaries: &BTreeMap<String, ToolBinary>) -> DeterminantHash {
        let mut hash = DeterminantHash::from_seed(b"pipewright-toolchain").combine_str(&version.to_string());
        for (name, binary) in binaries {
            hash = hash.combine_str(name).combine(&binary.hash);
        }
        hash
    }

    /// Load a toolchain file
    pub fn load(path: &Path) -> Result<Self, ToolChainError> {
        if !path.exists() {
            return Err(ToolChainError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        let toolchain: ToolChain = serde_json::from_str(&content)?;
        info!(path = %path.display(), binaries = toolchain.binaries.len(), "loaded toolchain");
        Ok(toolchain)
    }

    /// Save the toolchain file
    pub fn save(&self, path: &Path) -> Result<(), ToolChainError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
