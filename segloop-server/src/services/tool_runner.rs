//! External command execution
//!
//! The nnU-Net tools are long-running Python programs. Every invocation is
//! bounded by a timeout and the child is killed when the future is dropped.

use async_trait::async_trait;
use segloop_common::{Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// One program invocation
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Command line for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external programs
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run to completion. A non-zero exit is an external error carrying
    /// stderr; exceeding the timeout is a timeout error.
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutput>;
}

/// `tokio::process` implementation
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutput> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        tracing::info!(command = %command.display(), "Running external tool");

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::external(&command.program, "binary not found in PATH")
            } else {
                Error::external(&command.program, e.to_string())
            }
        })?;

        // Dropping the wait future on timeout kills the child
        let output = match tokio::time::timeout(command.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| Error::external(&command.program, e.to_string()))?,
            Err(_) => {
                tracing::error!(
                    command = %command.display(),
                    timeout_secs = command.timeout.as_secs(),
                    "External tool timed out"
                );
                return Err(Error::Timeout(format!(
                    "{} did not finish within {} s",
                    command.program,
                    command.timeout.as_secs()
                )));
            }
        };

        let result = ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            tracing::error!(
                command = %command.display(),
                exit_code = ?result.exit_code,
                "External tool failed"
            );
            let message = if result.stderr.trim().is_empty() {
                format!("exited with status {:?}", result.exit_code)
            } else {
                result.stderr.trim().to_string()
            };
            return Err(Error::external(&command.program, message));
        }

        Ok(result)
    }
}
