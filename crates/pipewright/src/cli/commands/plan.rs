//! Plan command: show the waves a run would execute

use std::sync::Arc;

use clap::Args;

use pipewright_pipelines::{tool_version, LocalRunner, PipelineRegistry};
use pipewright_tasks::TracingProgress;

use super::run::PipelineArgs;
use crate::cli::output;
use crate::cli::{Cli, OutputFormat};
use crate::exit_codes;

/// Show the execution plan
#[derive(Debug, Args)]
pub struct PlanCommand {
    #[command(flatten)]
    pub target: PipelineArgs,
}

impl PlanCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        print_plan(&self.target, cli)
    }
}

/// Build the schedule for `target` and print its waves.
///
/// Building the schedule runs the pipeline's bootstrap tasks.
pub fn print_plan(target: &PipelineArgs, cli: &Cli) -> anyhow::Result<i32> {
    let (run, _) = target.local_run()?;
    let runner = LocalRunner::new(
        PipelineRegistry::with_builtins(tool_version()),
        Arc::new(TracingProgress),
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let schedule = match runtime.block_on(runner.plan(&run)) {
        Ok(schedule) => schedule,
        Err(e) if e.is_fatal_setup() => {
            output::error(&e.to_string());
            return Ok(exit_codes::CONFIG_ERROR);
        }
        Err(e) => return Err(e.into()),
    };

    let dependencies = schedule.dependencies();
    if cli.format == OutputFormat::Json {
        let waves: Vec<Vec<String>> = dependencies
            .waves()?
            .into_iter()
            .map(|wave| wave.iter().map(|t| t.to_string()).collect())
            .collect();
        let plan = serde_json::json!({
            "tasks": dependencies.len(),
            "waves": waves,
        });
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!("{}", output::header("Execution plan"));
        println!("{}", output::key_value("Tasks", &dependencies.len().to_string()));
        println!();
        print!("{}", dependencies.execution_plan()?);
    }

    Ok(exit_codes::SUCCESS)
}
