//! Shell command execution for task bodies

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use tracing::debug;

use pipewright_tasks::TaskError;

/// Output of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Runs shell commands on behalf of tasks.
///
/// Registered in the [`DependencyProvider`](pipewright_tasks::DependencyProvider)
/// so every task shares one working directory and environment.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every command from `dir`
    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Run `command` through the platform shell.
    ///
    /// A non-zero exit is an error carrying the command's stderr.
    pub fn run(&self, command: &str) -> Result<CommandOutput, TaskError> {
        let start = Instant::now();

        let shell = if cfg!(windows) { "cmd" } else { "sh" };
        let shell_arg = if cfg!(windows) { "/C" } else { "-c" };

        let mut cmd = Command::new(shell);
        cmd.arg(shell_arg).arg(command);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!(command, "running command");
        let output = cmd
            .output()
            .map_err(|e| TaskError::Command(format!("Failed to run '{}': {}", command, e)))?;

        let result = CommandOutput {
            command: command.to_string(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        };

        if !output.status.success() {
            let code = result
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(TaskError::Command(format!(
                "'{}' exited with {}: {}",
                command,
                code,
                result.stderr.trim()
            )));
        }

        Ok(result)
    }
}

/// Quote a path for interpolation into a `sh -c` command line
pub fn shell_quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if cfg!(windows) {
        return format!("\"{}\"", raw);
    }
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_captures_stdout() {
        let output = CommandRunner::new().run("echo hello").unwrap();
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.exit_code, Some(0));
    }

    #[test]
    fn test_non_zero_exit_is_error() {
        let err = CommandRunner::new().run("echo broken >&2; exit 3").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exited with 3"));
        assert!(message.contains("broken"));
    }

    #[test]
    fn test_cwd_and_env() {
        let temp = TempDir::new().unwrap();
        let runner = CommandRunner::new()
            .with_cwd(temp.path())
            .with_env("PW_GREETING", "hi");
        runner.run("printf \"$PW_GREETING\" > out.txt").unwrap();
        assert_eq!(std::fs::read_to_string(temp.path().join("out.txt")).unwrap(), "hi");
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        let quoted = shell_quote(Path::new("it's here.txt"));
        assert_eq!(quoted, r"'it'\''s here.txt'");
        let output = CommandRunner::new().run(&format!("printf %s {}", quoted)).unwrap();
        assert_eq!(output.stdout, "it's here.txt");
    }
}
