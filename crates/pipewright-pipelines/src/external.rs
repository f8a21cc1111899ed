//! External pipeline executables
//!
//! An external pipeline is any executable speaking JSON over stdin/stdout.
//! Each call is a fresh process that receives one request:
//!
//! ```json
//! { "action": "execute", "input": { ... }, "config": { ... } }
//! ```
//!
//! and answers with `{ "output": ... }` or `{ "error": "..." }`.
//!
//! Actions: `info`, `initialise`, `schedule` (returns
//! `[{ "task": ..., "dependencies": [...] }]`) and `execute` (returns
//! `{ "status": "completed" | "cached" | "failed", "message", "build_hashes" }`).
//! The executable keeps its own artifact cache; the build-hash ledger is
//! sent with every `schedule` and `execute` request and the hashes it
//! returns are folded back into the stash.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

use pipewright_core::{Configuration, FileHash, ToolChain};
use pipewright_tasks::{
    report_outcome, Dependencies, DependencyProvider, Pipeline, Progress, Schedule, Stash,
    TaskDescriptor, TaskError, TaskOutcome,
};

use crate::error::{PipelineError, Result};

/// Request sent to the executable on stdin
#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub action: String,
    pub input: serde_json::Value,
    pub config: serde_json::Value,
}

/// Response read from the executable's stdout
#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Self-description returned by the `info` action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One entry of a `schedule` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task: TaskDescriptor,
    #[serde(default)]
    pub dependencies: Vec<TaskDescriptor>,
}

/// Status of an `execute` response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecuteStatus {
    Completed,
    Cached,
    Failed,
}

/// Body of an `execute` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteOutput {
    pub status: ExecuteStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub build_hashes: Vec<(PathBuf, FileHash)>,
}

/// A pipeline implemented by an external executable
#[derive(Debug)]
pub struct ExternalPipeline {
    id: String,
    command: PathBuf,
    cwd: Option<PathBuf>,
    config: serde_json::Value,
    info: Option<PipelineInfo>,
    // Holds the isolated copy of the executable alive for the pipeline's lifetime.
    _isolation: Option<TempDir>,
}

impl ExternalPipeline {
    /// Pipeline backed by `command`
    pub fn new(id: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            cwd: None,
            config: serde_json::Value::Null,
            info: None,
            _isolation: None,
        }
    }

    /// Keep `dir` (which holds the executable copy) until the pipeline is dropped
    pub fn with_isolation(mut self, dir: TempDir) -> Self {
        self._isolation = Some(dir);
        self
    }

    /// Run the executable from `dir`
    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Path of the executable being run
    pub fn command(&self) -> &Path {
        &self.command
    }

    /// Info reported by the executable, available after `initialise`
    pub fn info(&self) -> Option<&PipelineInfo> {
        self.info.as_ref()
    }

    /// Send one request and return its `output`
    #[instrument(skip(self, input), fields(pipeline = %self.id))]
    pub fn request(&self, action: &str, input: serde_json::Value) -> Result<serde_json::Value> {
        let request = PipelineRequest {
            action: action.to_string(),
            input,
            config: self.config.clone(),
        };
        let request_json = serde_json::to_vec(&request)
            .map_err(|e| PipelineError::protocol(&self.id, action, e.to_string()))?;

        let mut cmd = Command::new(&self.command);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            PipelineError::protocol(&self.id, action, format!("Failed to spawn pipeline: {}", e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&request_json).map_err(|e| {
                PipelineError::protocol(&self.id, action, format!("Failed to write request: {}", e))
            })?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| PipelineError::protocol(&self.id, action, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::protocol(&self.id, action, stderr.trim()));
        }

        let response: PipelineResponse = serde_json::from_slice(&output.stdout).map_err(|e| {
            PipelineError::protocol(&self.id, action, format!("Invalid response: {}", e))
        })?;

        if let Some(error) = response.error {
            return Err(PipelineError::protocol(&self.id, action, error));
        }

        debug!(action, "pipeline responded");
        Ok(response.output.unwrap_or(serde_json::Value::Null))
    }

    /// Ask the executable to describe itself, falling back to the id
    pub fn query_info(&self) -> PipelineInfo {
        let fallback = || PipelineInfo {
            name: self.id.clone(),
            version: "unknown".to_string(),
            description: None,
        };

        match self.request("info", serde_json::Value::Null) {
            Ok(serde_json::Value::Null) => fallback(),
            Ok(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(pipeline = %self.id, error = %e, "malformed info response");
                fallback()
            }),
            Err(e) => {
                debug!(pipeline = %self.id, error = %e, "info action unavailable");
                fallback()
            }
        }
    }

    fn call<T: serde::de::DeserializeOwned>(
        &self,
        action: &str,
        input: serde_json::Value,
    ) -> std::result::Result<T, TaskError> {
        let value = self
            .request(action, input)
            .map_err(|e| TaskError::Command(e.to_string()))?;
        Ok(serde_json::from_value(value)?)
    }

    fn execute_task(
        &self,
        task: &TaskDescriptor,
        stash: &dyn Stash,
    ) -> std::result::Result<TaskOutcome, TaskError> {
        let input = serde_json::json!({
            "task": task,
            "build_hashes": ledger(stash),
        });
        let output: ExecuteOutput = self.call("execute", input)?;

        for (path, hash) in &output.build_hashes {
            stash.set_build_hash_code(path, *hash);
        }

        match output.status {
            ExecuteStatus::Completed => Ok(TaskOutcome::Built(output.message)),
            ExecuteStatus::Cached => Ok(TaskOutcome::Cached(output.message)),
            ExecuteStatus::Failed => Err(TaskError::Command(output.message)),
        }
    }
}

fn ledger(stash: &dyn Stash) -> Vec<(PathBuf, FileHash)> {
    stash.build_hash_codes().into_iter().collect()
}

impl Pipeline for ExternalPipeline {
    fn id(&self) -> &str {
        &self.id
    }

    fn initialise(
        &mut self,
        toolchain: &ToolChain,
        configuration: &Configuration,
    ) -> std::result::Result<(), TaskError> {
        let header = configuration.header()?;
        header.verify_version(&toolchain.version)?;

        let body = configuration.body()?;
        let settings: serde_json::Value = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(body)?
        };

        self.config = serde_json::json!({
            "pipeline_id": header.pipeline_id,
            "version": header.version,
            "toolchain": {
                "version": toolchain.version,
                "hash": toolchain.toolchain_hash,
            },
            "settings": settings,
        });

        let info = self.query_info();
        info!(pipeline = %self.id, name = %info.name, version = %info.version, "loaded external pipeline");
        self.info = Some(info);

        self.request("initialise", serde_json::Value::Null)
            .map_err(|e| TaskError::Command(e.to_string()))?;
        Ok(())
    }

    fn get_schedule(
        &self,
        _progress: &dyn Progress,
        stash: &dyn Stash,
    ) -> std::result::Result<Schedule, TaskError> {
        let input = serde_json::json!({ "build_hashes": ledger(stash) });
        let tasks: Vec<ScheduledTask> = self.call("schedule", input)?;

        let mut dependencies = Dependencies::new();
        for entry in tasks {
            dependencies.add(entry.task, entry.dependencies);
        }
        Ok(Schedule::new(dependencies))
    }

    fn execute(
        &self,
        task: &TaskDescriptor,
        progress: &dyn Progress,
        stash: &dyn Stash,
        _provider: &DependencyProvider,
    ) {
        progress.started(task, "running");
        report_outcome(progress, task, self.execute_task(task, stash));
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use pipewright_core::ConfigurationHeader;
    use pipewright_tasks::{CollectingProgress, FileStash};
    use std::os::unix::fs::PermissionsExt;

    pub(crate) const FAKE_PIPELINE: &str = r#"#!/bin/sh
req=$(cat)
case "$req" in
  *'"action":"info"'*)
    echo '{"output":{"name":"fake","version":"1.0.0"}}' ;;
  *'"action":"initialise"'*)
    case "$req" in
      *'"reject":true'*) echo '{"error":"settings rejected"}' ;;
      *) echo '{"output":null}' ;;
    esac ;;
  *'"action":"schedule"'*)
    echo '{"output":[{"task":{"name":"b","source_file":"","payload":[]},"dependencies":[]},{"task":{"name":"a","source_file":"x","payload":[]},"dependencies":[{"name":"b","source_file":"","payload":[]}]}]}' ;;
  *'"name":"a"'*)
    echo '{"output":{"status":"cached","message":"hit","build_hashes":[["out/a","ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb"]]}}' ;;
  *'"name":"fail"'*)
    echo '{"output":{"status":"failed","message":"nope"}}' ;;
  *)
    echo '{"output":{"status":"completed","message":"built"}}' ;;
esac
"#;

    pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn configuration(settings: serde_json::Value) -> (ToolChain, Configuration) {
        let version = semver::Version::new(0, 3, 0);
        let header = ConfigurationHeader::new("exec:fake", version.clone());
        let config = Configuration::new(&header, &serde_json::to_vec(&settings).unwrap()).unwrap();
        (ToolChain::bare(version), config)
    }

    fn initialised(dir: &Path) -> ExternalPipeline {
        let script = write_script(dir, "fake-pipeline", FAKE_PIPELINE);
        let mut pipeline = ExternalPipeline::new("exec:fake", script);
        let (toolchain, config) = configuration(serde_json::json!({ "reject": false }));
        pipeline.initialise(&toolchain, &config).unwrap();
        pipeline
    }

    #[test]
    fn test_initialise_queries_info() {
        let temp = tempfile::TempDir::new().unwrap();
        let pipeline = initialised(temp.path());
        assert_eq!(pipeline.info().unwrap().name, "fake");
        assert_eq!(pipeline.id(), "exec:fake");
    }

    #[test]
    fn test_initialise_error_is_surfaced() {
        let temp = tempfile::TempDir::new().unwrap();
        let script = write_script(temp.path(), "fake-pipeline", FAKE_PIPELINE);
        let mut pipeline = ExternalPipeline::new("exec:fake", script);
        let (toolchain, config) = configuration(serde_json::json!({ "reject": true }));

        let err = pipeline.initialise(&toolchain, &config).unwrap_err();
        assert!(err.to_string().contains("settings rejected"));
    }

    #[test]
    fn test_schedule_from_response() {
        let temp = tempfile::TempDir::new().unwrap();
        let pipeline = initialised(temp.path());
        let stash = FileStash::new(temp.path().join("stash"));

        let schedule = pipeline
            .get_schedule(&CollectingProgress::default(), &stash)
            .unwrap();
        let ready: Vec<String> = schedule.get_ready().iter().map(|t| t.to_string()).collect();
        assert_eq!(ready, vec!["b"]);
        assert!(schedule.get_task("a", "x").is_some());
    }

    #[test]
    fn test_execute_statuses_and_hashes() {
        let temp = tempfile::TempDir::new().unwrap();
        let pipeline = initialised(temp.path());
        let stash = FileStash::new(temp.path().join("stash"));
        let progress = CollectingProgress::default();
        let provider = DependencyProvider::new();

        let a = TaskDescriptor::new("a", "x", vec![]);
        let b = TaskDescriptor::new("b", "", vec![]);
        let fail = TaskDescriptor::new("fail", "", vec![]);
        pipeline.execute(&b, &progress, &stash, &provider);
        pipeline.execute(&a, &progress, &stash, &provider);
        pipeline.execute(&fail, &progress, &stash, &provider);

        assert_eq!(progress.completed_tasks(), vec![(b, false), (a, true)]);
        assert_eq!(progress.failures(), vec![(fail, "nope".to_string())]);
        assert_eq!(
            stash.build_hash_codes().get(Path::new("out/a")),
            Some(&FileHash::of_bytes(b"a"))
        );
    }

    #[test]
    fn test_non_zero_exit_is_protocol_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let script = write_script(temp.path(), "broken", "#!/bin/sh\necho boom >&2\nexit 1\n");
        let pipeline = ExternalPipeline::new("exec:broken", script);

        let err = pipeline.request("schedule", serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, PipelineError::Protocol { .. }));
        assert!(err.to_string().contains("boom"));
        assert_eq!(pipeline.query_info().name, "exec:broken");
    }
}
