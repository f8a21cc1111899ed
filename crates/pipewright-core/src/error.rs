//! Error types for pipewright

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Main error type for core operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Hash parsing or computation errors
    #[error(transparent)]
    Hash(#[from] HashError),

    /// Toolchain errors
    #[error(transparent)]
    ToolChain(#[from] ToolChainError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Create a new "other" error with a message
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Self::Other(msg.into())
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    NotFound(PathBuf),

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// The configuration envelope could not be decoded
    #[error("Invalid configuration envelope: {0}")]
    InvalidEnvelope(String),

    /// Configuration was produced by a different tool version
    #[error("Configuration version {found} does not match tool version {expected}")]
    VersionMismatch {
        expected: semver::Version,
        found: semver::Version,
    },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Hash-related errors
#[derive(Debug, Error)]
pub enum HashError {
    /// Hex text was not 64 lowercase hex characters
    #[error("Invalid hash '{0}': expected 64 hex characters")]
    InvalidHex(String),

    /// File could not be read for hashing
    #[error("Failed to hash {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Toolchain-related errors
#[derive(Debug, Error)]
pub enum ToolChainError {
    /// Toolchain file missing
    #[error("Failed to locate toolchain file: {0}")]
    NotFound(PathBuf),

    /// Binary could not be fingerprinted
    #[error("Failed to fingerprint toolchain binary '{name}': {source}")]
    Binary {
        name: String,
        #[source]
        source: HashError,
    },

    /// Toolchain file was malformed
    #[error("Invalid toolchain file: {0}")]
    Parse(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
