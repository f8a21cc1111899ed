//! Configure command: serialize the project configuration

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tracing::info;

use pipewright_core::config::load_config_or_default;
use pipewright_pipelines::tool_version;

use crate::cli::output;
use crate::cli::{Cli, OutputFormat};
use crate::exit_codes;

/// Write the configuration a pipeline run consumes
#[derive(Debug, Args)]
pub struct ConfigureCommand {
    /// Output file
    #[arg(short, long)]
    pub output: PathBuf,
}

impl ConfigureCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let cwd = std::env::current_dir()?;
        let (config, source) = load_config_or_default(&cwd)?;
        info!(source = ?source, output = %self.output.display(), "executing configure command");

        let configuration = config.to_configuration(&tool_version())?;
        configuration
            .save(&self.output)
            .with_context(|| format!("Failed to write {}", self.output.display()))?;
        let header = configuration.header()?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "output": self.output.display().to_string(),
                "pipeline_id": header.pipeline_id,
                "version": header.version.to_string(),
                "bytes": configuration.as_bytes().len(),
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            output::success(&format!(
                "Wrote configuration to {}",
                output::path_style().apply_to(self.output.display())
            ));
            println!("{}", output::key_value("Pipeline", &header.pipeline_id));
            println!("{}", output::key_value("Version", &header.version.to_string()));
            if source.is_none() {
                output::warning("No pipewright.toml found, used defaults");
            }
        }

        Ok(exit_codes::SUCCESS)
    }
}
