//! Run command: execute a pipeline locally

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use console::style;
use tracing::{info, warn};

use pipewright_core::config::load_config_or_default;
use pipewright_core::{Config, Configuration, ToolChain};
use pipewright_pipelines::{tool_version, LocalRun, LocalRunner, PipelineError, PipelineRegistry};
use pipewright_tasks::{PipelineResult, ProgressRegistry};

use crate::cli::output::{self, ConsoleProgress};
use crate::cli::{Cli, OutputFormat};
use crate::exit_codes;

/// What to run: configuration, toolchain, stash and task selection
#[derive(Debug, Args)]
pub struct PipelineArgs {
    /// Serialized configuration file (default: built from pipewright.toml)
    pub configuration: Option<PathBuf>,

    /// Stash directory (default: stash.dir from pipewright.toml)
    #[arg(long)]
    pub stash_dir: Option<PathBuf>,

    /// Toolchain file written by `pipewright toolchain`
    #[arg(long)]
    pub toolchain: Option<PathBuf>,

    /// Result of an earlier run to resume from
    #[arg(long)]
    pub result_in: Option<PathBuf>,

    /// Only run tasks with this name
    #[arg(long)]
    pub task: Option<String>,

    /// Only run the task for this source file
    #[arg(long, requires = "task")]
    pub source: Option<String>,

    /// Also run everything the selected task depends on
    #[arg(long, requires = "task")]
    pub execute_up_to: bool,
}

impl PipelineArgs {
    /// Resolve the arguments against the project configuration
    pub fn local_run(&self) -> anyhow::Result<(LocalRun, Config)> {
        let cwd = std::env::current_dir()?;
        let (config, config_path) = load_config_or_default(&cwd)?;
        if let Some(path) = &config_path {
            info!(path = %path.display(), "using project config");
        }

        let version = tool_version();
        let configuration = match &self.configuration {
            Some(path) => Configuration::load(path)
                .with_context(|| format!("Failed to read configuration {}", path.display()))?,
            None => config.to_configuration(&version)?,
        };

        let toolchain = load_toolchain(self.toolchain.as_deref(), &config, &version)?;
        let stash_dir = self
            .stash_dir
            .clone()
            .unwrap_or_else(|| config.stash.dir.clone());

        let mut run = LocalRun::new(stash_dir, toolchain, configuration);
        run.task = self.task.clone();
        run.source = self.source.clone();
        run.execute_up_to = self.execute_up_to;
        run.force_no_stash = !config.stash.enabled;
        run.concurrency = config.execution.concurrency;
        run.task_timeout = config.execution.task_timeout_secs.map(Duration::from_secs);

        if let Some(path) = &self.result_in {
            let prior = PipelineResult::load(path)
                .with_context(|| format!("Failed to read prior result {}", path.display()))?;
            run.prior_result = Some(prior);
        }

        Ok((run, config))
    }
}

/// Toolchain from a file, from configured binaries, or bare
pub fn load_toolchain(
    file: Option<&Path>,
    config: &Config,
    version: &semver::Version,
) -> anyhow::Result<ToolChain> {
    if let Some(path) = file.or(config.toolchain.file.as_deref()) {
        return Ok(ToolChain::load(path)?);
    }
    if !config.toolchain.binaries.is_empty() {
        return Ok(ToolChain::from_binaries(
            version.clone(),
            config.toolchain.binaries.iter(),
        )?);
    }
    Ok(ToolChain::bare(version.clone()))
}

/// Run a pipeline
#[derive(Debug, Args)]
pub struct RunCommand {
    #[command(flatten)]
    pub target: PipelineArgs,

    /// Write the result (success, message, build hashes) to this file
    #[arg(long)]
    pub result_out: Option<PathBuf>,

    /// Rebuild everything, ignoring stashed artifacts
    #[arg(long)]
    pub force_no_stash: bool,

    /// Maximum concurrent tasks
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Per-task timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Show execution plan without running
    #[arg(long)]
    pub dry_run: bool,
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        if self.dry_run {
            return super::plan::print_plan(&self.target, cli);
        }

        let (mut run, config) = self.target.local_run()?;
        run.force_no_stash |= self.force_no_stash;
        if let Some(concurrency) = self.concurrency {
            run.concurrency = concurrency;
        }
        if let Some(secs) = self.timeout {
            run.task_timeout = Some(Duration::from_secs(secs));
        }
        let result_out = self
            .result_out
            .clone()
            .or_else(|| config.execution.result_file.clone());

        let mut progress = ProgressRegistry::new();
        if !cli.quiet && cli.format == OutputFormat::Text {
            progress.register(ConsoleProgress::new(cli.verbose));
        }
        let runner = LocalRunner::new(
            PipelineRegistry::with_builtins(tool_version()),
            Arc::new(progress),
        );

        if !cli.quiet && cli.format == OutputFormat::Text {
            output::info(&format!(
                "Running pipeline ({} workers, stash {})",
                run.concurrency,
                output::path_style().apply_to(run.stash_dir.display())
            ));
        }

        let runtime = tokio::runtime::Runtime::new()?;
        let outcome = runtime.block_on(runner.run(run));
        // Timed-out tasks may still hold blocking threads.
        runtime.shutdown_background();

        let code = match &outcome {
            Ok(result) if result.success => exit_codes::SUCCESS,
            Ok(_) => exit_codes::ERROR,
            Err(e) if e.is_fatal_setup() => exit_codes::CONFIG_ERROR,
            Err(_) => exit_codes::ERROR,
        };

        let written = match &result_out {
            Some(path) => save_result(&outcome, path)?,
            None => false,
        };
        if let (Err(_), Some(path)) = (&outcome, &result_out) {
            warn!(path = %path.display(), "run did not finish, result file left unchanged");
        }

        let result = outcome.unwrap_or_else(|e| PipelineResult::failure(e.to_string()));
        report(&result, result_out.as_deref().filter(|_| written), cli)?;
        Ok(code)
    }
}

/// Write the outcome of a run to `path`, returning whether anything was written.
///
/// Only runs that reached the executor are written, task failures included:
/// their ledger still holds every hash seeded from the prior result. Setup
/// failures and stalls leave an existing file untouched.
fn save_result(outcome: &Result<PipelineResult, PipelineError>, path: &Path) -> anyhow::Result<bool> {
    let Ok(result) = outcome else {
        return Ok(false);
    };
    result
        .save(path)
        .with_context(|| format!("Failed to write result {}", path.display()))?;
    Ok(true)
}

fn report(result: &PipelineResult, result_out: Option<&Path>, cli: &Cli) -> anyhow::Result<()> {
    if cli.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    if result.success {
        if !cli.quiet {
            output::success(&result.message);
        }
    } else {
        output::error(&result.message);
    }

    if let (Some(path), false) = (result_out, cli.quiet) {
        println!(
            "  {} {}",
            style("Result written to").dim(),
            output::path_style().apply_to(path.display())
        );
    }
    Ok(())
}
