//! Pipeline plugin contract

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pipewright_core::{ConfigError, Configuration, HashError, ToolChain};

use crate::progress::Progress;
use crate::schedule::{Schedule, ScheduleError};
use crate::stash::{Stash, StashError};
use crate::task::TaskDescriptor;

/// An implementation of graph construction and task execution.
///
/// `initialise` is called exactly once, before anything else. After that the
/// pipeline is shared between worker threads.
pub trait Pipeline: Send + Sync {
    /// Identifier the pipeline was resolved from
    fn id(&self) -> &str;

    /// Decode the configuration. Fails on a version mismatch.
    fn initialise(&mut self, toolchain: &ToolChain, configuration: &Configuration) -> Result<(), TaskError>;

    /// Build the schedule for a run.
    ///
    /// May execute bootstrap tasks synchronously when the graph depends on
    /// a build product (e.g. a manifest of sources).
    fn get_schedule(&self, progress: &dyn Progress, stash: &dyn Stash) -> Result<Schedule, TaskError>;

    /// Execute one task. Failures are reported through `progress`, never returned.
    fn execute(
        &self,
        task: &TaskDescriptor,
        progress: &dyn Progress,
        stash: &dyn Stash,
        provider: &DependencyProvider,
    );
}

/// How a successful task finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Output was produced and stashed
    Built(String),
    /// Output was restored from the stash
    Cached(String),
}

/// Report the result of a task body through `progress`
pub fn report_outcome<E: fmt::Display>(
    progress: &dyn Progress,
    task: &TaskDescriptor,
    result: Result<TaskOutcome, E>,
) {
    match result {
        Ok(TaskOutcome::Built(message)) => progress.completed(task, &message),
        Ok(TaskOutcome::Cached(message)) => progress.cached(task, &message),
        Err(e) => progress.failed(task, &e.to_string()),
    }
}

/// Process-local collaborators a task may need, keyed by type
#[derive(Default, Clone)]
pub struct DependencyProvider {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl DependencyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collaborator, replacing any previous one of the same type
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.insert_shared(Arc::new(value));
    }

    /// Register an already shared collaborator
    pub fn insert_shared<T: Any + Send + Sync>(&mut self, value: Arc<T>) {
        self.entries.insert(TypeId::of::<T>(), value);
    }

    /// Look up a collaborator by type
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Look up a collaborator, failing if it was never registered
    pub fn require<T: Any + Send + Sync>(&self) -> Result<Arc<T>, TaskError> {
        self.get::<T>()
            .ok_or_else(|| TaskError::MissingDependency(type_name::<T>().to_string()))
    }

    /// Fail if the run this provider belongs to has been cancelled.
    ///
    /// Task bodies call this before committing or stashing output.
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        match self.get::<Cancellation>() {
            Some(cancellation) if cancellation.is_cancelled() => Err(TaskError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Run-wide cancellation flag, shared with task bodies through the
/// [`DependencyProvider`]
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for DependencyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyProvider")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Errors raised by pipeline implementations
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Configuration could not be decoded or has the wrong version
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Stash failure
    #[error(transparent)]
    Stash(#[from] StashError),

    /// An input file could not be hashed
    #[error(transparent)]
    Hash(#[from] HashError),

    /// Schedule construction failure
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Task payload could not be decoded
    #[error("Invalid payload for task {task}: {source}")]
    Payload {
        task: String,
        #[source]
        source: serde_json::Error,
    },

    /// A collaborator was not registered with the dependency provider
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// The pipeline was used before `initialise`
    #[error("Pipeline '{0}' used before initialise")]
    NotInitialised(String),

    /// The run was cancelled while the task was still working
    #[error("Cancelled before the output was committed")]
    Cancelled,

    /// A command run by a task failed
    #[error("{0}")]
    Command(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::CollectingProgress;

    #[derive(Debug, PartialEq)]
    struct Parser(&'static str);

    #[test]
    fn test_provider_lookup_by_type() {
        let mut provider = DependencyProvider::new();
        provider.insert(Parser("v1"));
        provider.insert(42u32);

        assert_eq!(*provider.get::<Parser>().unwrap(), Parser("v1"));
        assert_eq!(*provider.get::<u32>().unwrap(), 42);
        assert!(provider.get::<String>().is_none());
        assert!(matches!(
            provider.require::<String>(),
            Err(TaskError::MissingDependency(_))
        ));
    }

    #[test]
    fn test_provider_replaces_same_type() {
        let mut provider = DependencyProvider::new();
        provider.insert(Parser("v1"));
        provider.insert_shared(Arc::new(Parser("v2")));
        assert_eq!(*provider.require::<Parser>().unwrap(), Parser("v2"));
    }

    #[test]
    fn test_check_cancelled_follows_shared_flag() {
        let mut provider = DependencyProvider::new();
        assert!(provider.check_cancelled().is_ok());

        let cancellation = Cancellation::new();
        provider.insert(cancellation.clone());
        let shared = provider.clone();
        assert!(shared.check_cancelled().is_ok());

        cancellation.cancel();
        assert!(matches!(shared.check_cancelled(), Err(TaskError::Cancelled)));
    }

    #[test]
    fn test_report_outcome() {
        let progress = CollectingProgress::default();
        let task = TaskDescriptor::new("compile", "a.src", vec![]);

        report_outcome::<TaskError>(&progress, &task, Ok(TaskOutcome::Built("built".into())));
        report_outcome::<TaskError>(&progress, &task, Ok(TaskOutcome::Cached("hit".into())));
        report_outcome(&progress, &task, Err(TaskError::Command("exit 1".into())));

        assert_eq!(
            progress.completed_tasks(),
            vec![(task.clone(), false), (task.clone(), true)]
        );
        assert_eq!(progress.failures(), vec![(task, "exit 1".to_string())]);
    }
}
