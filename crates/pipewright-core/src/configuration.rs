//! Pipeline configuration envelope
//!
//! A configuration is an opaque byte buffer handed to a pipeline
//! implementation. Only its header is understood by the orchestrator:
//!
//! ```text
//! +------+-----------------+-------------------+-----------------+
//! | PWCF | header len (LE) | header JSON       | body (opaque)   |
//! | 4 B  | u32             | pipeline id + ver | pipeline-owned  |
//! +------+-----------------+-------------------+-----------------+
//! ```
//!
//! The header can be read without decoding the body, which lets the
//! registry validate compatibility before loading anything.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const MAGIC: &[u8; 4] = b"PWCF";
const PREFIX_LEN: usize = MAGIC.len() + 4;

/// Independently parseable configuration header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationHeader {
    /// Resolvable reference to a pipeline implementation
    pub pipeline_id: String,
    /// Tool version the configuration was produced by
    pub version: semver::Version,
}

impl ConfigurationHeader {
    /// Create a header
    pub fn new(pipeline_id: impl Into<String>, version: semver::Version) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            version,
        }
    }

    /// Fail unless the header was produced by `expected`
    pub fn verify_version(&self, expected: &semver::Version) -> Result<(), ConfigError> {
        if &self.version != expected {
            return Err(ConfigError::VersionMismatch {
                expected: expected.clone(),
                found: self.version.clone(),
            });
        }
        Ok(())
    }
}

/// Serialized pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration(Vec<u8>);

impl Configuration {
    /// Build a configuration from a header and a pipeline-specific body
    pub fn new(header: &ConfigurationHeader, body: &[u8]) -> Result<Self, ConfigError> {
        let header_json = serde_json::to_vec(header)?;
        let header_len = u32::try_from(header_json.len())
            .map_err(|_| ConfigError::InvalidEnvelope("header too large".to_string()))?;

        let mut data = Vec::with_capacity(PREFIX_LEN + header_json.len() + body.len());
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&header_len.to_le_bytes());
        data.extend_from_slice(&header_json);
        data.extend_from_slice(body);
        Ok(Self(data))
    }

    /// Wrap raw bytes, validating that a header is present
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ConfigError> {
        let config = Self(data);
        config.header()?;
        Ok(config)
    }

    /// The underlying bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn header_len(&self) -> Result<usize, ConfigError> {
        if self.0.len() < PREFIX_LEN || &self.0[..MAGIC.len()] != MAGIC {
            return Err(ConfigError::InvalidEnvelope("missing magic".to_string()));
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&self.0[MAGIC.len()..PREFIX_LEN]);
        let len = u32::from_le_bytes(len) as usize;
        if self.0.len() < PREFIX_LEN + len {
            return Err(ConfigError::InvalidEnvelope(format!(
                "header truncated: expected {} bytes, found {}",
                len,
                self.0.len() - PREFIX_LEN
            )));
        }
        Ok(len)
    }

    /// Decode only the header
    pub fn header(&self) -> Result<ConfigurationHeader, ConfigError> {
        let len = self.header_len()?;
        serde_json::from_slice(&self.0[PREFIX_LEN..PREFIX_LEN + len])
            .map_err(|e| ConfigError::InvalidEnvelope(format!("bad header: {}", e)))
    }

    /// Pipeline-specific remainder
    pub fn body(&self) -> Result<&[u8], ConfigError> {
        let len = self.header_len()?;
        Ok(&self.0[PREFIX_LEN + len..])
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::from_bytes(fs::read(path)?)
    }

    /// Save the configuration to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, &self.0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ConfigurationHeader {
        ConfigurationHeader::new("stages", semver::Version::new(0, 1, 0))
    }

    #[test]
    fn test_header_and_body() {
        let config = Configuration::new(&header(), b"{\"x\":1}").unwrap();
        assert_eq!(config.header().unwrap(), header());
        assert_eq!(config.body().unwrap(), b"{\"x\":1}");
    }

    #[test]
    fn test_header_readable_with_undecodable_body() {
        let config = Configuration::new(&header(), &[0xff, 0x00, 0xfe]).unwrap();
        assert_eq!(config.header().unwrap().pipeline_id, "stages");
    }

    #[test]
    fn test_missing_magic() {
        let err = Configuration::from_bytes(b"nope".to_vec()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvelope(_)));
    }

    #[test]
    fn test_truncated_header() {
        let config = Configuration::new(&header(), b"").unwrap();
        let mut bytes = config.as_bytes().to_vec();
        bytes.truncate(bytes.len() - 3);
        assert!(Configuration::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_version_check() {
        let h = header();
        assert!(h.verify_version(&semver::Version::new(0, 1, 0)).is_ok());
        let err = h.verify_version(&semver::Version::new(0, 2, 0)).unwrap_err();
        assert!(matches!(err, ConfigError::VersionMismatch { .. }));
    }
}
