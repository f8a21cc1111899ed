//! Wave executor: drives a schedule to completion with tokio

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::pipeline::{Cancellation, DependencyProvider, Pipeline};
use crate::progress::{FailureLatch, Progress};
use crate::schedule::{Schedule, ScheduleError};
use crate::stash::{NoRestoreStash, Stash};
use crate::task::TaskDescriptor;

/// Result of a single task execution
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// Task that was executed
    pub task: TaskDescriptor,
    /// How the task finished
    pub status: TaskStatus,
    /// How long the task took
    pub duration: Duration,
}

/// Task execution status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Task did its work
    Succeeded,
    /// Task output was restored from the stash
    Cached,
    /// Task reported a failure, panicked, or timed out
    Failed(String),
}

impl TaskStatus {
    /// Check if this status represents success
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Cached)
    }
}

/// Options for the executor
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Maximum concurrent tasks within a wave
    pub concurrency: usize,
    /// Per-task time limit; exceeding it counts as a failure
    pub task_timeout: Option<Duration>,
    /// Tasks that must rebuild; they see the stash through [`NoRestoreStash`]
    pub no_restore: BTreeSet<TaskDescriptor>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus(),
            task_timeout: None,
            no_restore: BTreeSet::new(),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// What happened during a run
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Every executed task, in completion order per wave
    pub tasks: Vec<TaskReport>,
    /// Number of waves executed
    pub waves: usize,
    /// Total wall time
    pub duration: Duration,
}

impl ExecutionReport {
    /// First failed task, if any
    pub fn failure(&self) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| !t.status.is_success())
    }

    /// Whether every executed task succeeded
    pub fn is_success(&self) -> bool {
        self.failure().is_none()
    }

    /// Number of tasks restored from the stash
    pub fn cached(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Cached)
            .count()
    }

    /// User-facing summary naming the failed task, if any
    pub fn message(&self) -> String {
        match self.failure() {
            Some(TaskReport {
                task,
                status: TaskStatus::Failed(reason),
                ..
            }) => format!("Task {} failed: {}", task, reason),
            _ => format!(
                "Executed {} tasks in {} waves ({} cached)",
                self.tasks.len(),
                self.waves,
                self.cached()
            ),
        }
    }
}

/// Executes a schedule wave by wave.
///
/// Each wave is the schedule's current ready set. Tasks in a wave run in
/// parallel on the blocking pool, bounded by `concurrency`. The whole wave is
/// joined before any completion is fed back, so the stall check only ever
/// sees a fully drained wave.
///
/// A timed-out task keeps running on its blocking thread after the run
/// returns. Each run therefore registers a [`Cancellation`] with the provider
/// and cancels it on timeout; task bodies must call
/// [`DependencyProvider::check_cancelled`] before committing or stashing.
pub struct WaveExecutor {
    options: ExecutorOptions,
}

impl WaveExecutor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self { options }
    }

    /// Run until the schedule completes or a wave contains a failure.
    ///
    /// A task failure stops the run after its wave and is reported in the
    /// returned report. A stall is an error.
    #[instrument(skip_all, fields(pipeline = pipeline.id(), tasks = schedule.dependencies().len()))]
    pub async fn run(
        &self,
        pipeline: Arc<dyn Pipeline>,
        schedule: &mut Schedule,
        progress: Arc<dyn Progress>,
        stash: Arc<dyn Stash>,
        provider: Arc<DependencyProvider>,
    ) -> Result<ExecutionReport, ScheduleError> {
        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut report = ExecutionReport::default();

        let cancellation = Cancellation::new();
        let mut scoped = (*provider).clone();
        scoped.insert(cancellation.clone());
        let provider = Arc::new(scoped);

        while !schedule.is_complete() {
            let ready = schedule.get_ready();
            if ready.is_empty() {
                let stall = schedule
                    .stall_report()
                    .unwrap_or(ScheduleError::Stalled { pending: Vec::new() });
                warn!(error = %stall, "schedule stalled");
                return Err(stall);
            }

            info!(wave = report.waves, task_count = ready.len(), "starting wave");
            report.waves += 1;

            let mut handles = Vec::with_capacity(ready.len());
            for task in ready {
                let semaphore = semaphore.clone();
                let pipeline = pipeline.clone();
                let progress = progress.clone();
                let stash = stash.clone();
                let provider = provider.clone();
                let timeout = self.options.task_timeout;
                let cancellation = cancellation.clone();
                let no_restore = self.options.no_restore.contains(&task);
                let id = task.clone();

                let handle = tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return TaskReport {
                                task,
                                status: TaskStatus::Failed("executor shut down".to_string()),
                                duration: Duration::ZERO,
                            }
                        }
                    };
                    execute_task(task, pipeline, progress, stash, provider, timeout, cancellation, no_restore)
                        .await
                });
                handles.push((id, handle));
            }

            // Join the whole wave before touching the schedule
            let mut failed = false;
            for (id, handle) in handles {
                let task_report = match handle.await {
                    Ok(task_report) => task_report,
                    Err(e) => {
                        let reason = format!("Task panicked: {}", e);
                        progress.failed(&id, &reason);
                        TaskReport {
                            task: id,
                            status: TaskStatus::Failed(reason),
                            duration: Duration::ZERO,
                        }
                    }
                };

                if task_report.status.is_success() {
                    schedule.complete(task_report.task.clone());
                } else {
                    failed = true;
                }
                report.tasks.push(task_report);
            }

            if failed {
                break;
            }
        }

        report.duration = start.elapsed();
        info!(
            executed = report.tasks.len(),
            cached = report.cached(),
            waves = report.waves,
            success = report.is_success(),
            duration_secs = report.duration.as_secs_f64(),
            "execution finished"
        );
        Ok(report)
    }
}

/// Run one task on the blocking pool
#[allow(clippy::too_many_arguments)]
async fn execute_task(
    task: TaskDescriptor,
    pipeline: Arc<dyn Pipeline>,
    progress: Arc<dyn Progress>,
    stash: Arc<dyn Stash>,
    provider: Arc<DependencyProvider>,
    timeout: Option<Duration>,
    cancellation: Cancellation,
    no_restore: bool,
) -> TaskReport {
    let start = Instant::now();
    let worker_task = task.clone();
    let worker_progress = progress.clone();

    let work = tokio::task::spawn_blocking(move || {
        let latch = FailureLatch::new(&*worker_progress);
        if no_restore {
            pipeline.execute(&worker_task, &latch, &NoRestoreStash::new(&*stash), &provider);
        } else {
            pipeline.execute(&worker_task, &latch, &*stash, &provider);
        }
        if latch.has_failed() {
            TaskStatus::Failed(latch.failure_message().unwrap_or_default())
        } else if latch.was_cached() {
            TaskStatus::Cached
        } else {
            TaskStatus::Succeeded
        }
    });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(joined) => joined,
            Err(_) => {
                cancellation.cancel();
                let reason = format!("timed out after {:.1}s", limit.as_secs_f64());
                progress.failed(&task, &reason);
                return TaskReport {
                    task,
                    status: TaskStatus::Failed(reason),
                    duration: start.elapsed(),
                };
            }
        },
        None => work.await,
    };

    let status = match joined {
        Ok(status) => status,
        Err(e) => {
            let reason = format!("Task panicked: {}", e);
            progress.failed(&task, &reason);
            TaskStatus::Failed(reason)
        }
    };

    TaskReport {
        task,
        status,
        duration: start.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use pipewright_core::{Configuration, DeterminantHash, FileHash, ToolChain};

    use crate::artifact::ArtifactHeader;
    use crate::dag::Dependencies;
    use crate::pipeline::TaskError;
    use crate::progress::CollectingProgress;

    fn t(name: &str) -> TaskDescriptor {
        TaskDescriptor::new(name, "", vec![])
    }

    /// Restores always hit
    struct NullStash;

    impl Stash for NullStash {
        fn get_build_hash_code(&self, path: &Path) -> crate::stash::Result<FileHash> {
            Ok(FileHash::of_bytes(path.to_string_lossy().as_bytes()))
        }
        fn set_build_hash_code(&self, _: &Path, _: FileHash) {}
        fn refresh_build_hash_code(&self, path: &Path) -> crate::stash::Result<FileHash> {
            self.get_build_hash_code(path)
        }
        fn stash(&self, _: &Path, _: &DeterminantHash) -> crate::stash::Result<()> {
            Ok(())
        }
        fn restore(&self, _: &Path, _: &DeterminantHash) -> bool {
            true
        }
        fn restore_artifact(&self, _: &Path, _: &DeterminantHash, _: &ArtifactHeader) -> bool {
            false
        }
        fn build_hash_codes(&self) -> BTreeMap<PathBuf, FileHash> {
            BTreeMap::new()
        }
    }

    /// Records execution order; behaviour per task name
    #[derive(Default)]
    struct ScriptedPipeline {
        executed: Mutex<Vec<String>>,
        running: AtomicUsize,
        peak: AtomicUsize,
        saw_cancel: AtomicBool,
    }

    impl Pipeline for ScriptedPipeline {
        fn id(&self) -> &str {
            "scripted"
        }

        fn initialise(&mut self, _: &ToolChain, _: &Configuration) -> Result<(), TaskError> {
            Ok(())
        }

        fn get_schedule(&self, _: &dyn Progress, _: &dyn Stash) -> Result<Schedule, TaskError> {
            Ok(Schedule::new(Dependencies::new()))
        }

        fn execute(&self, task: &TaskDescriptor, progress: &dyn Progress, stash: &dyn Stash, provider: &DependencyProvider) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.executed.lock().unwrap().push(task.name.clone());

            match task.name.as_str() {
                "fail" => progress.failed(task, "exit status 1"),
                "panic" => panic!("task body panicked"),
                "slow" => std::thread::sleep(Duration::from_millis(500)),
                "overrun" => {
                    std::thread::sleep(Duration::from_millis(200));
                    if provider.check_cancelled().is_err() {
                        self.saw_cancel.store(true, Ordering::SeqCst);
                    }
                }
                "cached" => progress.cached(task, "restored"),
                "restore" => {
                    if stash.restore(Path::new("out"), &DeterminantHash::from_seed(b"out")) {
                        progress.cached(task, "restored");
                    } else {
                        progress.completed(task, "rebuilt");
                    }
                }
                name if name.starts_with("wide") => {
                    std::thread::sleep(Duration::from_millis(30));
                    progress.completed(task, "done");
                }
                _ => progress.completed(task, "done"),
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn run(
        deps: Dependencies,
        options: ExecutorOptions,
    ) -> (Result<ExecutionReport, ScheduleError>, Arc<ScriptedPipeline>, Arc<CollectingProgress>, Schedule) {
        let pipeline = Arc::new(ScriptedPipeline::default());
        let progress = Arc::new(CollectingProgress::default());
        let mut schedule = Schedule::new(deps);
        let result = WaveExecutor::new(options)
            .run(
                pipeline.clone(),
                &mut schedule,
                progress.clone(),
                Arc::new(NullStash),
                Arc::new(DependencyProvider::new()),
            )
            .await;
        (result, pipeline, progress, schedule)
    }

    #[tokio::test]
    async fn test_runs_dependencies_first() {
        let mut deps = Dependencies::new();
        deps.add(t("a"), [t("b")]);
        deps.add(t("b"), [t("c")]);

        let (result, pipeline, _, schedule) = run(deps, ExecutorOptions::default()).await;
        let report = result.unwrap();
        assert!(report.is_success());
        assert_eq!(report.waves, 3);
        assert!(schedule.is_complete());
        assert_eq!(*pipeline.executed.lock().unwrap(), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_cached_status() {
        let mut deps = Dependencies::new();
        deps.add(t("a"), [t("cached")]);

        let (result, _, _, _) = run(deps, ExecutorOptions::default()).await;
        let report = result.unwrap();
        assert_eq!(report.cached(), 1);
        assert_eq!(report.tasks[0].status, TaskStatus::Cached);
        assert_eq!(report.tasks[1].status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_failure_stops_after_wave() {
        let mut deps = Dependencies::new();
        deps.add(t("top"), [t("fail"), t("ok")]);

        let (result, pipeline, progress, schedule) = run(deps, ExecutorOptions::default()).await;
        let report = result.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.waves, 1);
        assert!(report.message().contains("fail"));
        assert!(report.message().contains("exit status 1"));

        // The sibling in the same wave still ran and completed.
        let executed = pipeline.executed.lock().unwrap().clone();
        assert!(executed.contains(&"ok".to_string()));
        assert!(!executed.contains(&"top".to_string()));
        assert!(!schedule.is_complete());
        assert_eq!(progress.failures().len(), 1);
    }

    #[tokio::test]
    async fn test_panic_is_reported_as_failure() {
        let mut deps = Dependencies::new();
        deps.add(t("panic"), []);

        let (result, _, progress, _) = run(deps, ExecutorOptions::default()).await;
        let report = result.unwrap();
        let failure = report.failure().unwrap();
        assert!(matches!(&failure.status, TaskStatus::Failed(r) if r.contains("panicked")));
        assert_eq!(progress.failures().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let mut deps = Dependencies::new();
        deps.add(t("slow"), []);

        let options = ExecutorOptions {
            concurrency: 2,
            task_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let (result, _, progress, _) = run(deps, options).await;
        let report = result.unwrap();
        assert!(matches!(&report.failure().unwrap().status, TaskStatus::Failed(r) if r.contains("timed out")));
        assert_eq!(progress.failures().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_cancels_task_still_running() {
        let mut deps = Dependencies::new();
        deps.add(t("overrun"), []);

        let options = ExecutorOptions {
            concurrency: 1,
            task_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let (result, pipeline, _, _) = run(deps, options).await;
        assert!(!result.unwrap().is_success());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(pipeline.saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_no_restore_only_for_listed_tasks() {
        let forced = TaskDescriptor::new("restore", "a", vec![]);
        let other = TaskDescriptor::new("restore", "b", vec![]);
        let mut deps = Dependencies::new();
        deps.add(forced.clone(), []);
        deps.add(other.clone(), []);

        let options = ExecutorOptions {
            no_restore: [forced.clone()].into_iter().collect(),
            ..Default::default()
        };
        let (result, _, _, _) = run(deps, options).await;
        let report = result.unwrap();

        let status = |task: &TaskDescriptor| {
            report
                .tasks
                .iter()
                .find(|r| &r.task == task)
                .map(|r| r.status.clone())
                .unwrap()
        };
        assert_eq!(status(&forced), TaskStatus::Succeeded);
        assert_eq!(status(&other), TaskStatus::Cached);
    }

    #[tokio::test]
    async fn test_cycle_is_fatal_stall() {
        let mut deps = Dependencies::new();
        deps.add(t("x"), [t("y")]);
        deps.add(t("y"), [t("x")]);
        deps.add(t("free"), []);

        let (result, pipeline, _, _) = run(deps, ExecutorOptions::default()).await;
        let err = result.unwrap_err();
        assert!(matches!(&err, ScheduleError::Stalled { pending } if pending.len() == 2));
        assert_eq!(*pipeline.executed.lock().unwrap(), vec!["free"]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let mut deps = Dependencies::new();
        deps.add(t("top"), (0..8).map(|i| t(&format!("wide{}", i))));

        let options = ExecutorOptions {
            concurrency: 2,
            task_timeout: None,
            ..Default::default()
        };
        let (result, pipeline, _, _) = run(deps, options).await;
        assert!(result.unwrap().is_success());
        assert!(pipeline.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_empty_schedule_is_complete() {
        let (result, _, _, _) = run(Dependencies::new(), ExecutorOptions::default()).await;
        let report = result.unwrap();
        assert_eq!(report.waves, 0);
        assert!(report.is_success());
    }
}
