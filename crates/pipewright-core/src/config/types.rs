//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::configuration::{Configuration, ConfigurationHeader};
use crate::error::ConfigError;

/// Main project configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which pipeline implementation to run
    pub pipeline: PipelineConfig,

    /// Persistent artifact cache
    pub stash: StashConfig,

    /// Scheduling and execution options
    pub execution: ExecutionConfig,

    /// Binaries fingerprinted into every determinant
    pub toolchain: ToolchainConfig,

    /// Pipeline-specific settings, passed through as the configuration body
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub settings: serde_json::Value,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            stash: StashConfig::default(),
            execution: ExecutionConfig::default(),
            toolchain: ToolchainConfig::default(),
            settings: serde_json::Value::Null,
        }
    }
}

impl Config {
    /// Build the configuration envelope handed to the pipeline registry
    pub fn to_configuration(&self, version: &semver::Version) -> Result<Configuration, ConfigError> {
        let version = self.pipeline.version.clone().unwrap_or_else(|| version.clone());
        let header = ConfigurationHeader::new(self.pipeline.id.clone(), version);
        let body = serde_json::to_vec(&self.settings)?;
        Configuration::new(&header, &body)
    }
}

/// Pipeline selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pipeline identifier (e.g. "stages" or "exec:/path/to/plugin")
    pub id: String,

    /// Pin the configuration to a specific tool version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<semver::Version>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            id: "stages".to_string(),
            version: None,
        }
    }
}

/// Stash configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StashConfig {
    /// Whether restoring from the stash is enabled
    pub enabled: bool,

    /// Stash directory
    pub dir: PathBuf,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(".pipewright/stash"),
        }
    }
}

/// Execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum concurrent tasks within a wave
    pub concurrency: usize,

    /// Per-task timeout in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_timeout_secs: Option<u64>,

    /// Where to write the run result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_file: Option<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            task_timeout_secs: None,
            result_file: None,
        }
    }
}

/// Toolchain configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Pre-computed toolchain file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Binaries to fingerprint, by logical name
    pub binaries: BTreeMap<String, PathBuf>,
}
