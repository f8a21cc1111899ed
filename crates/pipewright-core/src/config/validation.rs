//! Configuration validation

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_pipeline(config)?;
    validate_stash(config)?;
    validate_execution(config)?;
    validate_toolchain(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_pipeline(config: &Config) -> Result<()> {
    let id = config.pipeline.id.trim();
    if id.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "pipeline.id".to_string(),
            message: "pipeline id cannot be empty".to_string(),
        }
        .into());
    }

    if let Some(path) = id.strip_prefix("exec:") {
        if path.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.id".to_string(),
                message: "exec: pipelines must name an executable".to_string(),
            }
            .into());
        }
    }

    Ok(())
}

fn validate_stash(config: &Config) -> Result<()> {
    if config.stash.enabled && config.stash.dir.as_os_str().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "stash.dir".to_string(),
            message: "stash directory cannot be empty".to_string(),
        }
        .into());
    }
    Ok(())
}

fn validate_execution(config: &Config) -> Result<()> {
    if config.execution.concurrency == 0 {
        return Err(ConfigError::InvalidValue {
            field: "execution.concurrency".to_string(),
            message: "must be at least 1".to_string(),
        }
        .into());
    }

    if config.execution.task_timeout_secs == Some(0) {
        return Err(ConfigError::InvalidValue {
            field: "execution.task_timeout_secs".to_string(),
            message: "must be greater than zero when set".to_string(),
        }
        .into());
    }

    Ok(())
}

fn validate_toolchain(config: &Config) -> Result<()> {
    if config.toolchain.file.is_some() && !config.toolchain.binaries.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "toolchain".to_string(),
            message: "set either toolchain.file or toolchain.binaries, not both".to_string(),
        }
        .into());
    }

    for name in config.toolchain.binaries.keys() {
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "toolchain.binaries".to_string(),
                message: "binary names cannot be empty".to_string(),
            }
            .into());
        }
    }

    Ok(())
}
