//! Cache management command

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use console::style;

use pipewright_core::config::load_config_or_default;
use pipewright_tasks::FileStash;

use crate::cli::{Cli, OutputFormat};
use crate::exit_codes;

/// Stash management
#[derive(Debug, Args)]
pub struct CacheCommand {
    /// Stash directory (default: stash.dir from pipewright.toml)
    #[arg(long, global = true)]
    pub stash_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Remove old stash entries
    Prune(CachePruneCommand),
    /// Show stash statistics
    Status(CacheStatusCommand),
    /// Clear all stashed entries
    Clean(CacheCleanCommand),
}

/// Prune old stash entries
#[derive(Debug, Args)]
pub struct CachePruneCommand {
    /// Maximum age in days (default: 7)
    #[arg(long, default_value = "7")]
    pub max_age_days: u64,
}

/// Show stash statistics
#[derive(Debug, Args)]
pub struct CacheStatusCommand;

/// Clear all stashed entries
#[derive(Debug, Args)]
pub struct CacheCleanCommand {
    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl CacheCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let stash = self.stash()?;
        match &self.action {
            CacheAction::Prune(cmd) => cmd.execute(&stash, cli),
            CacheAction::Status(cmd) => cmd.execute(&stash, cli),
            CacheAction::Clean(cmd) => cmd.execute(&stash, cli),
        }?;
        Ok(exit_codes::SUCCESS)
    }

    fn stash(&self) -> anyhow::Result<FileStash> {
        if let Some(dir) = &self.stash_dir {
            return Ok(FileStash::new(dir));
        }
        let cwd = std::env::current_dir()?;
        let (config, _) = load_config_or_default(&cwd)?;
        Ok(FileStash::new(config.stash.dir))
    }
}

impl CachePruneCommand {
    fn execute(&self, stash: &FileStash, cli: &Cli) -> anyhow::Result<()> {
        let max_age = Duration::from_secs(self.max_age_days * 24 * 60 * 60);

        if !cli.quiet && cli.format == OutputFormat::Text {
            println!(
                "{} Pruning stash entries older than {} days...",
                style("→").blue(),
                self.max_age_days
            );
        }

        let stats = stash.prune(max_age)?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "total": stats.total,
                "removed": stats.removed,
                "kept": stats.kept,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!(
                "  {} Removed {} of {} entries ({} kept)",
                style("✓").green(),
                stats.removed,
                stats.total,
                stats.kept
            );
        }

        Ok(())
    }
}

impl CacheStatusCommand {
    fn execute(&self, stash: &FileStash, cli: &Cli) -> anyhow::Result<()> {
        let stats = stash.status()?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "entries": stats.entries,
                "total_size": stats.total_size,
                "total_size_formatted": stats.formatted_size(),
                "stash_dir": stash.dir().display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!("{}", style("Stash Status").bold());
            println!();
            println!("  Location: {}", style(stash.dir().display()).cyan());
            println!("  Entries:  {}", stats.entries);
            println!("  Size:     {}", style(stats.formatted_size()).yellow());
        }

        Ok(())
    }
}

impl CacheCleanCommand {
    fn execute(&self, stash: &FileStash, cli: &Cli) -> anyhow::Result<()> {
        if !stash.dir().exists() {
            if !cli.quiet {
                println!("{} Stash directory does not exist.", style("✓").green());
            }
            return Ok(());
        }

        if !self.yes {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!(
                    "Remove all stashed entries at {}?",
                    stash.dir().display()
                ))
                .default(false)
                .interact()?;

            if !confirmed {
                println!("{}", style("Aborted.").yellow());
                return Ok(());
            }
        }

        let stats = stash.clean()?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "removed": stats.entries,
                "freed": stats.total_size,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!(
                "{} Removed {} entries ({}) from {}",
                style("✓").green(),
                stats.entries,
                stats.formatted_size(),
                style(stash.dir().display()).cyan()
            );
        }

        Ok(())
    }
}
