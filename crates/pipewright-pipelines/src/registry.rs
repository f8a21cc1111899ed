//! Pipeline registry
//!
//! Resolves the pipeline named by a configuration header to an
//! implementation. Built-in pipelines are registered factories; an id of the
//! form `exec:<path>` names an external executable, which is copied into an
//! isolated temp directory before it is run so the original can be rebuilt
//! while a run is in flight.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use tracing::{debug, info, instrument};

use pipewright_core::{Configuration, ToolChain};
use pipewright_tasks::Pipeline;

use crate::error::{PipelineError, Result};
use crate::external::ExternalPipeline;
use crate::stages::{StagesPipeline, STAGES_PIPELINE_ID};

/// Prefix of ids that name an external executable
pub const EXEC_PREFIX: &str = "exec:";

type PipelineFactory = Box<dyn Fn() -> Box<dyn Pipeline> + Send + Sync>;

/// Registry of pipeline implementations
pub struct PipelineRegistry {
    factories: HashMap<String, PipelineFactory>,
    version: semver::Version,
}

impl PipelineRegistry {
    /// Create an empty registry for a tool at `version`
    pub fn new(version: semver::Version) -> Self {
        Self {
            factories: HashMap::new(),
            version,
        }
    }

    /// Create a registry with the built-in pipelines
    pub fn with_builtins(version: semver::Version) -> Self {
        let mut registry = Self::new(version);
        registry.register(STAGES_PIPELINE_ID, || Box::new(StagesPipeline::new()));
        registry
    }

    /// Register a pipeline factory under `id`
    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Pipeline> + Send + Sync + 'static,
    {
        let id = id.into();
        debug!(pipeline_id = %id, "registering pipeline");
        self.factories.insert(id, Box::new(factory));
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// Tool version configurations must match
    pub fn version(&self) -> &semver::Version {
        &self.version
    }

    /// Resolve, load and initialise the pipeline named by `configuration`.
    ///
    /// Every step is appended to `log`. Any failure is fatal for the run.
    #[instrument(skip_all)]
    pub fn get_pipeline(
        &self,
        toolchain: &ToolChain,
        configuration: &Configuration,
        log: &mut dyn fmt::Write,
    ) -> Result<Box<dyn Pipeline>> {
        let header = configuration.header()?;
        note(
            log,
            format!("configuration: pipeline '{}' version {}", header.pipeline_id, header.version),
        );

        header.verify_version(&self.version)?;

        let mut pipeline = self.resolve(&header.pipeline_id, log)?;
        note(log, format!("initialising pipeline '{}'", header.pipeline_id));

        pipeline
            .initialise(toolchain, configuration)
            .map_err(|source| PipelineError::Initialise {
                id: header.pipeline_id.clone(),
                source,
            })?;

        info!(pipeline_id = %header.pipeline_id, "pipeline ready");
        note(log, format!("pipeline '{}' ready", header.pipeline_id));
        Ok(pipeline)
    }

    fn resolve(&self, id: &str, log: &mut dyn fmt::Write) -> Result<Box<dyn Pipeline>> {
        if let Some(path) = id.strip_prefix(EXEC_PREFIX) {
            return load_external(id, Path::new(path), log).map(|p| Box::new(p) as Box<dyn Pipeline>);
        }

        match self.factories.get(id) {
            Some(factory) => {
                note(log, format!("using built-in pipeline '{}'", id));
                Ok(factory())
            }
            None => Err(PipelineError::load(
                id,
                format!("unknown pipeline (available: {})", self.ids().join(", ")),
            )),
        }
    }
}

impl fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("ids", &self.ids())
            .field("version", &self.version)
            .finish()
    }
}

fn load_external(id: &str, path: &Path, log: &mut dyn fmt::Write) -> Result<ExternalPipeline> {
    if path.as_os_str().is_empty() {
        return Err(PipelineError::load(id, "no executable path given"));
    }
    if !path.is_file() {
        return Err(PipelineError::load(
            path.display().to_string(),
            "executable not found",
        ));
    }

    let isolation = tempfile::Builder::new()
        .prefix("pipewright-pipeline-")
        .tempdir()
        .map_err(|e| PipelineError::load(path.display().to_string(), e))?;
    let file_name = path.file_name().unwrap_or(path.as_os_str());
    let copy = isolation.path().join(file_name);

    fs::copy(path, &copy).map_err(|e| PipelineError::load(path.display().to_string(), e))?;
    note(
        log,
        format!("copied {} to {}", path.display(), copy.display()),
    );

    let cwd = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf);
    let mut pipeline = ExternalPipeline::new(id, copy).with_isolation(isolation);
    if let Some(cwd) = cwd {
        pipeline = pipeline.with_cwd(cwd);
    }
    Ok(pipeline)
}

fn note(log: &mut dyn fmt::Write, line: String) {
    debug!("{}", line);
    // Log sink errors are ignored.
    let _ = writeln!(log, "{}", line);
}
