//! Local pipeline runs
//!
//! Entry point for "run pipeline with configuration X, optionally resuming
//! from a prior result, optionally restricted to one task".

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use pipewright_core::{Configuration, ToolChain};
use pipewright_tasks::{
    Dependencies, DependencyProvider, ExecutionReport, ExecutorOptions, FileStash, NoRestoreStash,
    Pipeline, PipelineResult, Progress, Schedule, ScheduleError, Stash, TaskDescriptor,
    TracingProgress, WaveExecutor,
};

use crate::command::CommandRunner;
use crate::error::Result;
use crate::registry::PipelineRegistry;

/// Options for one local run
#[derive(Debug, Clone)]
pub struct LocalRun {
    /// Directory of the on-disk stash
    pub stash_dir: PathBuf,
    pub toolchain: ToolChain,
    pub configuration: Configuration,
    /// Restrict the run to tasks with this name
    pub task: Option<String>,
    /// Further restrict `task` to this source file
    pub source: Option<String>,
    /// Result of an earlier run whose ledger seeds this one
    pub prior_result: Option<PipelineResult>,
    /// Never restore the selected tasks from the stash (every task when
    /// no task is selected)
    pub force_no_stash: bool,
    /// Run the selected task together with everything it depends on
    pub execute_up_to: bool,
    pub concurrency: usize,
    pub task_timeout: Option<Duration>,
}

impl LocalRun {
    pub fn new(stash_dir: impl Into<PathBuf>, toolchain: ToolChain, configuration: Configuration) -> Self {
        Self {
            stash_dir: stash_dir.into(),
            toolchain,
            configuration,
            task: None,
            source: None,
            prior_result: None,
            force_no_stash: false,
            execute_up_to: false,
            concurrency: ExecutorOptions::default().concurrency,
            task_timeout: None,
        }
    }

    /// Select a single task, optionally for one source
    pub fn with_task(mut self, task: impl Into<String>, source: Option<String>) -> Self {
        self.task = Some(task.into());
        self.source = source;
        self
    }

    pub fn with_prior_result(mut self, result: PipelineResult) -> Self {
        self.prior_result = Some(result);
        self
    }
}

/// Loads a pipeline and drives it to completion
pub struct LocalRunner {
    registry: PipelineRegistry,
    progress: Arc<dyn Progress>,
    provider: DependencyProvider,
}

impl LocalRunner {
    /// Runner whose tasks get a [`CommandRunner`] from the provider
    pub fn new(registry: PipelineRegistry, progress: Arc<dyn Progress>) -> Self {
        let mut provider = DependencyProvider::new();
        provider.insert(CommandRunner::new());
        Self {
            registry,
            progress,
            provider,
        }
    }

    /// Make another collaborator available to tasks
    pub fn with_dependency<T: std::any::Any + Send + Sync>(mut self, value: T) -> Self {
        self.provider.insert(value);
        self
    }

    fn load(&self, run: &LocalRun) -> Result<(Arc<dyn Pipeline>, Arc<dyn Stash>)> {
        let mut log = String::new();
        let loaded = self
            .registry
            .get_pipeline(&run.toolchain, &run.configuration, &mut log);
        for line in log.lines() {
            debug!(target: "pipewright::load", "{}", line);
        }
        let pipeline: Arc<dyn Pipeline> = Arc::from(loaded?);

        let stash = FileStash::new(&run.stash_dir);
        stash.reset_build_hash_codes();
        if let Some(prior) = &run.prior_result {
            stash.seed_build_hash_codes(prior.build_hashes.clone());
        }

        let stash: Arc<dyn Stash> = if run.force_no_stash && run.task.is_none() {
            info!("stash restores disabled for this run");
            Arc::new(NoRestoreStash::new(stash))
        } else {
            Arc::new(stash)
        };
        Ok((pipeline, stash))
    }

    async fn schedule(&self, pipeline: Arc<dyn Pipeline>, stash: Arc<dyn Stash>) -> Result<Schedule> {
        let progress = self.progress.clone();
        let schedule =
            tokio::task::spawn_blocking(move || pipeline.get_schedule(&*progress, &*stash)).await??;
        Ok(schedule)
    }

    /// Load the pipeline and return the schedule a run would execute
    #[instrument(skip_all)]
    pub async fn plan(&self, run: &LocalRun) -> Result<Schedule> {
        let (pipeline, stash) = self.load(run)?;
        let schedule = self.schedule(pipeline, stash).await?;
        Ok(select(schedule, run)?)
    }

    /// Execute a run.
    ///
    /// Task failures produce a failed result. Load failures and stalls are
    /// errors.
    #[instrument(skip_all, fields(task = run.task.as_deref().unwrap_or("*")))]
    pub async fn run(&self, run: LocalRun) -> Result<PipelineResult> {
        let (pipeline, stash) = self.load(&run)?;
        let schedule = self.schedule(pipeline.clone(), stash.clone()).await?;
        let mut schedule = select(schedule, &run)?;

        let executor = WaveExecutor::new(ExecutorOptions {
            concurrency: run.concurrency,
            task_timeout: run.task_timeout,
            no_restore: forced_targets(&schedule, &run),
        });
        let report = executor
            .run(
                pipeline,
                &mut schedule,
                self.progress.clone(),
                stash.clone(),
                Arc::new(self.provider.clone()),
            )
            .await?;

        Ok(to_result(&report, &*stash))
    }
}

fn to_result(report: &ExecutionReport, stash: &dyn Stash) -> PipelineResult {
    let hashes = stash.build_hash_codes();
    if report.is_success() {
        PipelineResult::success(report.message(), hashes)
    } else {
        PipelineResult::failure(report.message()).with_build_hashes(hashes)
    }
}

/// Selected tasks that must rebuild when restores are disabled for a
/// single-task run. Full runs disable restores on the stash itself.
fn forced_targets(schedule: &Schedule, run: &LocalRun) -> BTreeSet<TaskDescriptor> {
    match (&run.task, run.force_no_stash) {
        (Some(name), true) => schedule
            .dependencies()
            .tasks()
            .iter()
            .filter(|task| task.matches(name, run.source.as_deref()))
            .cloned()
            .collect(),
        _ => BTreeSet::new(),
    }
}

/// Narrow a full schedule to the tasks a run asked for.
///
/// Without `execute_up_to` the selected tasks run on their own and their
/// dependencies are assumed to be built already.
pub fn select(schedule: Schedule, run: &LocalRun) -> std::result::Result<Schedule, ScheduleError> {
    let Some(name) = &run.task else {
        return Ok(schedule);
    };

    let targets: Vec<_> = match &run.source {
        Some(source) => schedule.get_task(name, source).into_iter().collect(),
        None => schedule.get_tasks(name),
    };
    if targets.is_empty() {
        let wanted = match &run.source {
            Some(source) => format!("{}({})", name, source),
            None => name.clone(),
        };
        return Err(ScheduleError::TaskNotFound(wanted));
    }

    let dependencies = if run.execute_up_to {
        Dependencies::subset(schedule.dependencies(), targets)
    } else {
        let mut dependencies = Dependencies::new();
        for target in targets {
            dependencies.add(target.clone(), std::iter::empty());
        }
        dependencies
    };

    info!(tasks = dependencies.len(), "selected tasks");
    Ok(Schedule::new(dependencies))
}

/// Version of this tool, which configurations must match
pub fn tool_version() -> semver::Version {
    semver::Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| semver::Version::new(0, 0, 0))
}

/// Run with the built-in pipelines, reporting progress through tracing
pub async fn run_pipeline_locally(run: LocalRun) -> Result<PipelineResult> {
    LocalRunner::new(
        PipelineRegistry::with_builtins(tool_version()),
        Arc::new(TracingProgress),
    )
    .run(run)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(name: &str, source: &str) -> TaskDescriptor {
        TaskDescriptor::new(name, source, vec![])
    }

    fn schedule() -> Schedule {
        let mut deps = Dependencies::new();
        deps.add(t("link", ""), [t("compile", "a"), t("compile", "b")]);
        deps.add(t("compile", "a"), [t("parse", "a")]);
        deps.add(t("compile", "b"), [t("parse", "b")]);
        Schedule::new(deps)
    }

    fn run() -> LocalRun {
        let version = tool_version();
        let header = pipewright_core::ConfigurationHeader::new("stages", version.clone());
        LocalRun::new(
            "stash",
            ToolChain::bare(version),
            Configuration::new(&header, b"null").unwrap(),
        )
    }

    #[test]
    fn test_select_everything_by_default() {
        let selected = select(schedule(), &run()).unwrap();
        assert_eq!(selected.dependencies().len(), 6);
    }

    #[test]
    fn test_select_single_task_has_no_edges() {
        let run = run().with_task("compile", Some("a".to_string()));
        let selected = select(schedule(), &run).unwrap();
        assert_eq!(selected.dependencies().len(), 1);
        assert_eq!(selected.get_ready().len(), 1);
    }

    #[test]
    fn test_select_by_name_only() {
        let run = run().with_task("compile", None);
        let selected = select(schedule(), &run).unwrap();
        assert_eq!(selected.get_ready().len(), 2);
    }

    #[test]
    fn test_select_up_to() {
        let mut run = run().with_task("compile", Some("b".to_string()));
        run.execute_up_to = true;
        let selected = select(schedule(), &run).unwrap();

        let names: Vec<String> = selected
            .dependencies()
            .tasks()
            .iter()
            .map(|t| t.to_string())
            .collect();
        assert_eq!(names, vec!["compile(b)", "parse(b)"]);
    }

    #[test]
    fn test_forced_targets_cover_only_selection() {
        // Full runs disable restores on the stash instead.
        let mut full = run();
        full.force_no_stash = true;
        assert!(forced_targets(&schedule(), &full).is_empty());

        let mut run = run().with_task("compile", Some("b".to_string()));
        run.execute_up_to = true;
        let selected = select(schedule(), &run).unwrap();
        assert!(forced_targets(&selected, &run).is_empty());

        run.force_no_stash = true;
        let forced: Vec<String> = forced_targets(&selected, &run)
            .iter()
            .map(|t| t.to_string())
            .collect();
        assert_eq!(forced, vec!["compile(b)"]);
    }

    #[test]
    fn test_select_unknown_task() {
        let run = run().with_task("compile", Some("zzz".to_string()));
        let err = select(schedule(), &run).unwrap_err();
        assert_eq!(err.to_string(), "Task not found: compile(zzz)");
    }
}
