//! CLI definition and command handling

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use commands::{
    CacheCommand, ConfigureCommand, InitCommand, PlanCommand, RunCommand, ToolchainCommand,
};

/// Pipewright - incremental build orchestrator
#[derive(Debug, Parser)]
#[command(name = "pipewright")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Write a starter pipewright.toml
    Init(InitCommand),

    /// Run a pipeline
    Run(RunCommand),

    /// Show the execution plan without running anything
    Plan(PlanCommand),

    /// Serialize the project configuration for a pipeline
    Configure(ConfigureCommand),

    /// Fingerprint the binaries used by a build
    Toolchain(ToolchainCommand),

    /// Stash maintenance
    Cache(CacheCommand),
}

impl Cli {
    /// Execute the CLI command, returning the process exit code
    pub fn execute(&self) -> anyhow::Result<i32> {
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)?;
        }

        match &self.command {
            Commands::Init(cmd) => cmd.execute(self),
            Commands::Run(cmd) => cmd.execute(self),
            Commands::Plan(cmd) => cmd.execute(self),
            Commands::Configure(cmd) => cmd.execute(self),
            Commands::Toolchain(cmd) => cmd.execute(self),
            Commands::Cache(cmd) => cmd.execute(self),
        }
    }
}
