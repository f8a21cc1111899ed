//! Pipewright Pipelines - pipeline implementations and local runs
//!
//! This crate resolves the pipeline named by a configuration (built-in or an
//! external executable), provides the built-in `stages` pipeline and the
//! file-system view its tasks use, and drives local runs end to end.

pub mod command;
pub mod environment;
pub mod error;
pub mod external;
pub mod local;
pub mod registry;
pub mod stages;

pub use command::{CommandOutput, CommandRunner};
pub use environment::{BuildEnvironment, BuildPath, LogicalPath, SourcePath, TempOutput};
pub use error::{PipelineError, Result};
pub use external::{ExternalPipeline, PipelineInfo};
pub use local::{run_pipeline_locally, select, tool_version, LocalRun, LocalRunner};
pub use registry::{PipelineRegistry, EXEC_PREFIX};
pub use stages::{StageConfig, StageTask, StagesPipeline, StagesSettings, STAGES_PIPELINE_ID};
