//! Pipewright Core - shared types for the incremental build orchestrator
//!
//! This crate provides hashing, toolchain fingerprinting, the configuration
//! envelope handed to pipelines, project configuration, and error types.

pub mod config;
pub mod configuration;
pub mod error;
pub mod hash;
pub mod toolchain;

pub use config::Config;
pub use configuration::{Configuration, ConfigurationHeader};
pub use error::{ConfigError, CoreError, HashError, Result, ToolChainError};
pub use hash::{DeterminantHash, FileHash};
pub use toolchain::{ToolBinary, ToolChain};
