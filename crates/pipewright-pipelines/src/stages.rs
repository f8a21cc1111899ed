//! Built-in `stages` pipeline
//!
//! Each configured stage is a shell command. A per-source stage runs once for
//! every source file; an aggregate stage runs once over all of its inputs.
//! Stages chain through `after`, and a final `complete` task records the
//! hashes of every output.
//!
//! The list of sources is itself a build product: `get_schedule` writes
//! `manifest.json` into the build directory before it builds the graph.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use pipewright_core::{ConfigError, Configuration, DeterminantHash, FileHash, ToolChain};
use pipewright_tasks::{
    report_outcome, ArtifactHeader, Dependencies, DependencyProvider, Pipeline, Progress,
    Schedule, Stash, TaskDescriptor, TaskError, TaskOutcome,
};

use crate::command::{shell_quote, CommandRunner};
use crate::environment::{BuildEnvironment, BuildPath, SourcePath};

/// Identifier the pipeline is registered under
pub const STAGES_PIPELINE_ID: &str = "stages";

const MANIFEST_TASK: &str = "manifest";
const COMPLETE_TASK: &str = "complete";
const MANIFEST_FILE: &str = "manifest.json";
const COMPLETE_FILE: &str = "complete.json";
const MANIFEST_SCHEMA: u32 = 1;

/// Pipeline settings, decoded from the configuration body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesSettings {
    /// Root of the source files
    pub source_dir: PathBuf,
    /// Root of every build output
    pub build_dir: PathBuf,
    /// Glob patterns, relative to `source_dir`
    pub sources: Vec<String>,
    /// Stages in declaration order
    pub stages: Vec<StageConfig>,
}

impl Default for StagesSettings {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("src"),
            build_dir: PathBuf::from("build"),
            sources: vec!["**/*".to_string()],
            stages: Vec::new(),
        }
    }
}

/// One stage of the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,

    /// Command template. Placeholders: `{input}`, `{inputs}`, `{output}`, `{source}`.
    pub command: String,

    /// Stages whose outputs this stage consumes
    #[serde(default)]
    pub after: Vec<String>,

    /// Run once over all inputs instead of once per source
    #[serde(default)]
    pub aggregate: bool,

    /// Extension of the output file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
}

impl StagesSettings {
    /// Decode settings from a configuration body. An empty or `null` body
    /// yields the defaults.
    pub fn from_body(body: &[u8]) -> Result<Self, ConfigError> {
        if body.is_empty() {
            return Ok(Self::default());
        }
        let value: serde_json::Value = serde_json::from_slice(body)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Check stage names and references
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();

        for (i, stage) in self.stages.iter().enumerate() {
            let field = |name: &str| format!("settings.stages[{}].{}", i, name);

            if stage.name.is_empty() {
                return Err(invalid(field("name"), "Stage name cannot be empty"));
            }
            if stage.name == MANIFEST_TASK || stage.name == COMPLETE_TASK {
                return Err(invalid(
                    field("name"),
                    format!("'{}' is reserved", stage.name),
                ));
            }
            if stage.command.trim().is_empty() {
                return Err(invalid(field("command"), "Command cannot be empty"));
            }
            for after in &stage.after {
                if !seen.contains(after.as_str()) {
                    return Err(invalid(
                        field("after"),
                        format!("'{}' must name a stage declared before '{}'", after, stage.name),
                    ));
                }
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(invalid(
                    field("name"),
                    format!("Duplicate stage '{}'", stage.name),
                ));
            }
        }

        if self.sources.is_empty() {
            return Err(invalid("settings.sources", "At least one pattern is required"));
        }
        Ok(())
    }

    fn stage(&self, name: &str) -> Result<&StageConfig, TaskError> {
        self.stages
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| invalid("settings.stages", format!("Unknown stage '{}'", name)).into())
    }
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        message: message.into(),
    }
}

/// Payload of a `stages` task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageTask {
    /// Glob the sources and write the manifest
    Manifest,
    /// One stage over one source
    PerSource { stage: String, source: String },
    /// One aggregate stage over every source
    Aggregate { stage: String, sources: Vec<String> },
    /// Record the hash of every output
    Complete { sources: Vec<String> },
}

impl StageTask {
    /// Descriptor for this task
    pub fn descriptor(&self) -> Result<TaskDescriptor, TaskError> {
        let (name, source) = match self {
            Self::Manifest => (MANIFEST_TASK, ""),
            Self::PerSource { stage, source } => (stage.as_str(), source.as_str()),
            Self::Aggregate { stage, .. } => (stage.as_str(), ""),
            Self::Complete { .. } => (COMPLETE_TASK, ""),
        };
        Ok(TaskDescriptor::encode(name, source, self)?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    sources: Vec<String>,
}

#[derive(Debug)]
struct Initialised {
    settings: StagesSettings,
    env: BuildEnvironment,
    toolchain_hash: DeterminantHash,
    artifact_header: ArtifactHeader,
}

/// The built-in `stages` pipeline
#[derive(Debug, Default)]
pub struct StagesPipeline {
    state: Option<Initialised>,
}

impl StagesPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<&Initialised, TaskError> {
        self.state
            .as_ref()
            .ok_or_else(|| TaskError::NotInitialised(STAGES_PIPELINE_ID.to_string()))
    }
}

impl Initialised {
    fn manifest_path(&self) -> BuildPath {
        BuildPath::new(MANIFEST_FILE)
    }

    fn output_path(&self, stage: &StageConfig, source: Option<&str>) -> BuildPath {
        let mut relative = PathBuf::from(&stage.name);
        match source {
            Some(source) => {
                let mut file = PathBuf::from(source);
                if let Some(ext) = &stage.extension {
                    file.set_extension(ext);
                }
                relative.push(file);
            }
            None => {
                let ext = stage.extension.as_deref().unwrap_or("out");
                relative.push(format!("{}.{}", stage.name, ext));
            }
        }
        BuildPath::new(relative)
    }

    /// Concrete paths a stage reads for `source` (or for all sources when aggregate)
    fn inputs(
        &self,
        stage: &StageConfig,
        source: Option<&str>,
        sources: &[String],
    ) -> Result<Vec<PathBuf>, TaskError> {
        if stage.after.is_empty() {
            return Ok(match source {
                Some(source) => vec![self.env.path(&SourcePath::new(source))],
                None => sources
                    .iter()
                    .map(|s| self.env.path(&SourcePath::new(s)))
                    .collect(),
            });
        }

        let mut inputs = Vec::new();
        for name in &stage.after {
            let upstream = self.settings.stage(name)?;
            if upstream.aggregate {
                inputs.push(self.env.path(&self.output_path(upstream, None)));
                continue;
            }
            match source {
                Some(source) => inputs.push(self.env.path(&self.output_path(upstream, Some(source)))),
                None => inputs.extend(
                    sources
                        .iter()
                        .map(|s| self.env.path(&self.output_path(upstream, Some(s)))),
                ),
            }
        }
        Ok(inputs)
    }

    /// Descriptors of the tasks a stage waits on for `source`
    fn upstream_tasks(
        &self,
        stage: &StageConfig,
        source: Option<&str>,
        sources: &[String],
    ) -> Result<Vec<TaskDescriptor>, TaskError> {
        let mut tasks = Vec::new();
        for name in &stage.after {
            let upstream = self.settings.stage(name)?;
            if upstream.aggregate {
                tasks.push(aggregate_task(upstream, sources).descriptor()?);
                continue;
            }
            match source {
                Some(source) => tasks.push(per_source_task(upstream, source).descriptor()?),
                None => {
                    for s in sources {
                        tasks.push(per_source_task(upstream, s).descriptor()?);
                    }
                }
            }
        }
        Ok(tasks)
    }

    fn all_outputs(&self, sources: &[String]) -> Vec<PathBuf> {
        let mut outputs = Vec::new();
        for stage in &self.settings.stages {
            if stage.aggregate {
                outputs.push(self.env.path(&self.output_path(stage, None)));
            } else {
                outputs.extend(
                    sources
                        .iter()
                        .map(|s| self.env.path(&self.output_path(stage, Some(s)))),
                );
            }
        }
        outputs
    }

    fn determinant<'a, I>(&self, stash: &dyn Stash, parts: &[&str], inputs: I) -> Result<DeterminantHash, TaskError>
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        let mut determinant = DeterminantHash::new(self.toolchain_hash);
        for part in parts {
            determinant = determinant.combine_str(part);
        }
        for input in inputs {
            let hash = self.input_hash(stash, input)?;
            determinant = determinant
                .combine_str(&input.to_string_lossy())
                .combine(&hash);
        }
        Ok(determinant)
    }

    /// Build outputs come from the ledger. Source files are hashed fresh
    /// every run and never enter the ledger, so a resumed run cannot trust
    /// the hash of an edited source.
    fn input_hash(&self, stash: &dyn Stash, input: &Path) -> Result<FileHash, TaskError> {
        if input.starts_with(self.env.build_dir()) {
            Ok(stash.get_build_hash_code(input)?)
        } else {
            Ok(FileHash::of_file(input)?)
        }
    }

    /// Glob the sources and write the manifest through the stash.
    fn write_manifest(&self, stash: &dyn Stash) -> Result<TaskOutcome, TaskError> {
        let sources = self.glob_sources()?;
        let manifest = self.manifest_path();
        let target = self.env.path(&manifest);

        let mut determinant = DeterminantHash::new(self.toolchain_hash)
            .combine_str(MANIFEST_TASK)
            .combine_str(&self.settings.source_dir.to_string_lossy());
        for pattern in &self.settings.sources {
            determinant = determinant.combine_str(pattern);
        }
        for source in &sources {
            determinant = determinant.combine_str(source);
        }

        if stash.restore_artifact(&target, &determinant, &self.artifact_header) {
            stash.refresh_build_hash_code(&target)?;
            return Ok(TaskOutcome::Cached(format!("restored {}", manifest)));
        }

        let body = serde_json::to_vec_pretty(&Manifest { sources: sources.clone() })?;
        let mut output = self.env.write_temp(&manifest)?;
        output.write_all(&self.artifact_header.wrap(&body)?)?;
        output.commit()?;

        stash.refresh_build_hash_code(&target)?;
        stash.stash(&target, &determinant)?;
        Ok(TaskOutcome::Built(format!(
            "wrote {} ({} sources)",
            manifest,
            sources.len()
        )))
    }

    fn read_manifest(&self) -> Result<Vec<String>, TaskError> {
        let bytes = self.env.read(&self.manifest_path())?;
        let (header, offset) = ArtifactHeader::read_from(&bytes)
            .ok_or_else(|| TaskError::Command(format!("{} has no artifact header", MANIFEST_FILE)))?;
        if header != self.artifact_header {
            return Err(TaskError::Command(format!(
                "{} was written by {} (schema {})",
                MANIFEST_FILE, header.tool_version, header.schema
            )));
        }
        let manifest: Manifest = serde_json::from_slice(&bytes[offset..])?;
        Ok(manifest.sources)
    }

    fn glob_sources(&self) -> Result<Vec<String>, TaskError> {
        let root = &self.settings.source_dir;
        let escaped = glob::Pattern::escape(&root.to_string_lossy());
        let mut sources = BTreeSet::new();

        for pattern in &self.settings.sources {
            let full = format!("{}/{}", escaped, pattern);
            let entries = glob::glob(&full)
                .map_err(|e| invalid("settings.sources", format!("'{}': {}", pattern, e)))?;

            for entry in entries {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        warn!(error = %e, "skipping unreadable source");
                        continue;
                    }
                };
                if !path.is_file() || path.starts_with(&self.settings.build_dir) {
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(root) {
                    sources.insert(to_slash(relative));
                }
            }
        }

        debug!(count = sources.len(), "globbed sources");
        Ok(sources.into_iter().collect())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_stage(
        &self,
        stage: &StageConfig,
        source: Option<&str>,
        sources: &[String],
        task: &TaskDescriptor,
        progress: &dyn Progress,
        stash: &dyn Stash,
        provider: &DependencyProvider,
    ) -> Result<TaskOutcome, TaskError> {
        let runner = provider.require::<CommandRunner>()?;
        let inputs = self.inputs(stage, source, sources)?;
        let output = self.output_path(stage, source);
        let target = self.env.path(&output);

        let determinant = self.determinant(
            stash,
            &[stage.name.as_str(), stage.command.as_str(), source.unwrap_or("")],
            &inputs,
        )?;

        if stash.restore(&target, &determinant) {
            stash.refresh_build_hash_code(&target)?;
            return Ok(TaskOutcome::Cached(format!("restored {}", output)));
        }

        let temp = self.env.write_temp(&output)?;
        let command = render_command(&stage.command, &inputs, temp.path(), source);
        let result = runner.run(&command)?;
        for line in result.stdout.lines().filter(|l| !l.trim().is_empty()) {
            progress.progress(task, line);
        }
        provider.check_cancelled()?;
        temp.commit()?;

        stash.refresh_build_hash_code(&target)?;
        stash.stash(&target, &determinant)?;
        Ok(TaskOutcome::Built(format!("wrote {}", output)))
    }

    fn write_complete(
        &self,
        sources: &[String],
        stash: &dyn Stash,
        provider: &DependencyProvider,
    ) -> Result<TaskOutcome, TaskError> {
        let outputs = self.all_outputs(sources);
        let determinant = self.determinant(stash, &[COMPLETE_TASK], &outputs)?;
        let complete = BuildPath::new(COMPLETE_FILE);
        let target = self.env.path(&complete);

        if stash.restore(&target, &determinant) {
            stash.refresh_build_hash_code(&target)?;
            return Ok(TaskOutcome::Cached(format!("restored {}", complete)));
        }

        let mut recorded = Vec::with_capacity(outputs.len());
        for path in &outputs {
            recorded.push((path.clone(), stash.get_build_hash_code(path)?.to_string()));
        }
        let body = serde_json::to_vec_pretty(&serde_json::json!({ "outputs": recorded }))?;

        let mut output = self.env.write_temp(&complete)?;
        output.write_all(&body)?;
        provider.check_cancelled()?;
        output.commit()?;

        stash.refresh_build_hash_code(&target)?;
        stash.stash(&target, &determinant)?;
        Ok(TaskOutcome::Built(format!("recorded {} outputs", outputs.len())))
    }
}

fn per_source_task(stage: &StageConfig, source: &str) -> StageTask {
    StageTask::PerSource {
        stage: stage.name.clone(),
        source: source.to_string(),
    }
}

fn aggregate_task(stage: &StageConfig, sources: &[String]) -> StageTask {
    StageTask::Aggregate {
        stage: stage.name.clone(),
        sources: sources.to_vec(),
    }
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Substitute placeholders in a stage command
pub fn render_command(template: &str, inputs: &[PathBuf], output: &Path, source: Option<&str>) -> String {
    let first = inputs.first().map(|p| shell_quote(p)).unwrap_or_default();
    let all = inputs
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ");
    let source = source
        .map(|s| shell_quote(Path::new(s)))
        .unwrap_or_default();

    template
        .replace("{inputs}", &all)
        .replace("{input}", &first)
        .replace("{output}", &shell_quote(output))
        .replace("{source}", &source)
}

impl Pipeline for StagesPipeline {
    fn id(&self) -> &str {
        STAGES_PIPELINE_ID
    }

    #[instrument(skip_all, fields(version = %toolchain.version))]
    fn initialise(&mut self, toolchain: &ToolChain, configuration: &Configuration) -> Result<(), TaskError> {
        let header = configuration.header()?;
        header.verify_version(&toolchain.version)?;

        let settings = StagesSettings::from_body(configuration.body()?)?;
        settings.validate()?;

        info!(
            stages = settings.stages.len(),
            source_dir = %settings.source_dir.display(),
            build_dir = %settings.build_dir.display(),
            "initialised stages pipeline"
        );

        self.state = Some(Initialised {
            env: BuildEnvironment::new(&settings.source_dir, &settings.build_dir),
            settings,
            toolchain_hash: toolchain.toolchain_hash,
            artifact_header: ArtifactHeader::new(MANIFEST_SCHEMA, toolchain.version.to_string()),
        });
        Ok(())
    }

    #[instrument(skip_all)]
    fn get_schedule(&self, progress: &dyn Progress, stash: &dyn Stash) -> Result<Schedule, TaskError> {
        let state = self.state()?;

        let manifest_task = StageTask::Manifest.descriptor()?;
        progress.started(&manifest_task, "globbing sources");
        match state.write_manifest(stash) {
            Ok(outcome) => report_outcome::<TaskError>(progress, &manifest_task, Ok(outcome)),
            Err(e) => {
                progress.failed(&manifest_task, &e.to_string());
                return Err(e);
            }
        }
        let sources = state.read_manifest()?;

        let mut dependencies = Dependencies::new();
        let mut all_tasks = Vec::new();

        for stage in &state.settings.stages {
            if stage.aggregate {
                let task = aggregate_task(stage, &sources).descriptor()?;
                dependencies.add(task.clone(), state.upstream_tasks(stage, None, &sources)?);
                all_tasks.push(task);
                continue;
            }
            for source in &sources {
                let task = per_source_task(stage, source).descriptor()?;
                dependencies.add(task.clone(), state.upstream_tasks(stage, Some(source), &sources)?);
                all_tasks.push(task);
            }
        }

        let complete = StageTask::Complete { sources }.descriptor()?;
        dependencies.add(complete, all_tasks);

        info!(tasks = dependencies.len(), "built stages schedule");
        Ok(Schedule::new(dependencies))
    }

    fn execute(
        &self,
        task: &TaskDescriptor,
        progress: &dyn Progress,
        stash: &dyn Stash,
        provider: &DependencyProvider,
    ) {
        progress.started(task, "running");
        let result = self.execute_task(task, progress, stash, provider);
        report_outcome(progress, task, result);
    }
}

impl StagesPipeline {
    fn execute_task(
        &self,
        task: &TaskDescriptor,
        progress: &dyn Progress,
        stash: &dyn Stash,
        provider: &DependencyProvider,
    ) -> Result<TaskOutcome, TaskError> {
        let state = self.state()?;
        let payload: StageTask = task.decode().map_err(|source| TaskError::Payload {
            task: task.to_string(),
            source,
        })?;

        match payload {
            StageTask::Manifest => state.write_manifest(stash),
            StageTask::PerSource { stage, source } => {
                let stage = state.settings.stage(&stage)?;
                state.run_stage(stage, Some(&source), &[], task, progress, stash, provider)
            }
            StageTask::Aggregate { stage, sources } => {
                let stage = state.settings.stage(&stage)?;
                state.run_stage(stage, None, &sources, task, progress, stash, provider)
            }
            StageTask::Complete { sources } => state.write_complete(&sources, stash, provider),
        }
    }
}
