//! Error types for pipeline loading and local runs

use thiserror::Error;

use pipewright_core::{ConfigError, ToolChainError};
use pipewright_tasks::{ScheduleError, StashError, TaskError};

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The pipeline implementation could not be located or loaded
    #[error("Failed to load pipeline from {location}: {source}")]
    Load {
        location: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The pipeline rejected its configuration
    #[error("Failed to initialise pipeline '{id}': {source}")]
    Initialise {
        id: String,
        #[source]
        source: TaskError,
    },

    /// An external pipeline returned an error or a malformed response
    #[error("Pipeline '{id}' {action} failed: {message}")]
    Protocol {
        id: String,
        action: String,
        message: String,
    },

    /// Configuration envelope or version problem
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Toolchain problem
    #[error(transparent)]
    ToolChain(#[from] ToolChainError),

    /// Task-level error raised outside a task (e.g. while building the schedule)
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Scheduling stall or unknown task
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Stash failure
    #[error(transparent)]
    Stash(#[from] StashError),

    /// A blocking worker panicked
    #[error("Worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Create a load error
    pub fn load(
        location: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Load {
            location: location.into(),
            source: source.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(id: impl Into<String>, action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            id: id.into(),
            action: action.into(),
            message: message.into(),
        }
    }

    /// Whether the error happened before any task could run
    pub fn is_fatal_setup(&self) -> bool {
        matches!(
            self,
            Self::Load { .. } | Self::Initialise { .. } | Self::Config(_) | Self::ToolChain(_)
        )
    }
}
