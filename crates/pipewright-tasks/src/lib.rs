//! Pipewright Tasks - task graph, scheduling and artifact stash
//!
//! This crate provides the dependency graph over task descriptors, the
//! stateful schedule, the content-addressable stash with its build-hash
//! ledger, the pipeline plugin contract, and the wave executor that drives a
//! schedule to completion.

pub mod artifact;
pub mod dag;
pub mod pipeline;
pub mod progress;
pub mod result;
pub mod schedule;
pub mod scheduler;
pub mod stash;
pub mod task;

pub use artifact::ArtifactHeader;
pub use dag::{DagError, Dependencies};
pub use pipeline::{
    report_outcome, Cancellation, DependencyProvider, Pipeline, TaskError, TaskOutcome,
};
pub use progress::{
    CollectingProgress, FailureLatch, Progress, ProgressEvent, ProgressRegistry, TracingProgress,
};
pub use result::PipelineResult;
pub use schedule::{Schedule, ScheduleError, StalledTask};
pub use scheduler::{ExecutionReport, ExecutorOptions, TaskReport, TaskStatus, WaveExecutor};
pub use stash::{FileStash, NoRestoreStash, PruneStats, Stash, StashError, StashStats};
pub use task::TaskDescriptor;
