//! Serializable run outcome

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::info;

use pipewright_core::FileHash;

/// Outcome of a pipeline run, including the build-hash ledger.
///
/// A later invocation can seed its ledger from `build_hashes` instead of
/// re-hashing outputs it cannot cheaply verify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    pub message: String,
    #[serde(
        serialize_with = "serialize_hashes",
        deserialize_with = "deserialize_hashes",
        default
    )]
    pub build_hashes: BTreeMap<PathBuf, FileHash>,
}

impl PipelineResult {
    pub fn success(message: impl Into<String>, build_hashes: BTreeMap<PathBuf, FileHash>) -> Self {
        Self {
            success: true,
            message: message.into(),
            build_hashes,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            build_hashes: BTreeMap::new(),
        }
    }

    /// Attach the ledger to a result
    pub fn with_build_hashes(mut self, build_hashes: BTreeMap<PathBuf, FileHash>) -> Self {
        self.build_hashes = build_hashes;
        self
    }

    /// Load a result file
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = fs::read_to_string(path)?;
        let result = serde_json::from_str(&content)?;
        info!(path = %path.display(), "loaded pipeline result");
        Ok(result)
    }

    /// Write a result file
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        crate::stash::write_atomic(path, json.as_bytes())
    }
}

fn serialize_hashes<S: Serializer>(
    hashes: &BTreeMap<PathBuf, FileHash>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(hashes.iter())
}

fn deserialize_hashes<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<PathBuf, FileHash>, D::Error> {
    let pairs: Vec<(PathBuf, FileHash)> = Vec::deserialize(deserializer)?;
    Ok(pairs.into_iter().collect())
}
