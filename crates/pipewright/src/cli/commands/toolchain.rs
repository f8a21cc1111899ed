//! Toolchain command: fingerprint build binaries

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use pipewright_core::config::load_config_or_default;
use pipewright_core::ToolChain;
use pipewright_pipelines::tool_version;

use crate::cli::output;
use crate::cli::{Cli, OutputFormat};
use crate::exit_codes;

/// Write a toolchain file
#[derive(Debug, Args)]
pub struct ToolchainCommand {
    /// Binary to fingerprint, as name=path (can be repeated)
    #[arg(long = "binary", value_parser = parse_binary)]
    pub binaries: Vec<(String, PathBuf)>,

    /// Output file
    #[arg(short, long)]
    pub output: PathBuf,
}

fn parse_binary(value: &str) -> Result<(String, PathBuf), String> {
    match value.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected name=path, got '{}'", value)),
    }
}

impl ToolchainCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let cwd = std::env::current_dir()?;
        let (config, _) = load_config_or_default(&cwd)?;

        // Command-line binaries override configured ones with the same name
        let mut binaries: BTreeMap<String, PathBuf> = config.toolchain.binaries.clone();
        binaries.extend(self.binaries.iter().cloned());

        let toolchain = ToolChain::from_binaries(tool_version(), binaries)?;
        toolchain
            .save(&self.output)
            .with_context(|| format!("Failed to write {}", self.output.display()))?;

        if cli.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&toolchain)?);
        } else if !cli.quiet {
            output::success(&format!(
                "Wrote toolchain to {}",
                output::path_style().apply_to(self.output.display())
            ));
            println!("{}", output::key_value("Hash", &toolchain.toolchain_hash.to_string()));
            for (name, binary) in &toolchain.binaries {
                println!(
                    "{}",
                    output::key_value(name, &format!("{} ({})", binary.path.display(), binary.hash))
                );
            }
        }

        Ok(exit_codes::SUCCESS)
    }
}
