//! Execution engine interface and shared types.
//!
//! Defines [`ScriptExecutor`], the seam the orchestrator runs scripts
//! through, along with [`ScriptInput`], [`ExecutionResult`], and
//! [`ScriptError`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::target::ExecutionTarget;

/// Default timeout for temp-file execution.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default timeout for stdin-streamed execution.
pub const DEFAULT_STDIN_TIMEOUT: Duration = Duration::from_secs(900);

/// How the script text reaches the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Write to a temporary file and run `bash <file>`. The file is deleted
    /// on every path.
    #[default]
    TempFile,
    /// Stream over the child's stdin to `bash -s`. Preferred for scripts
    /// that embed heredocs.
    Stdin,
}

/// One unit of work for the engine.
#[derive(Debug, Clone)]
pub struct ScriptInput {
    /// Rendered script body, without preamble.
    pub script: String,
    pub target: ExecutionTarget,
    pub delivery: Delivery,
    /// Additional environment variables set for the child process.
    pub env_vars: Vec<(String, String)>,
    /// Working directory for the child process (uses current dir if `None`).
    pub working_directory: Option<String>,
    /// Maximum wall-clock time before the process is killed.
    pub timeout: Duration,
}

impl ScriptInput {
    /// Local temp-file execution with the default 300 s timeout.
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            target: ExecutionTarget::Local,
            delivery: Delivery::TempFile,
            env_vars: Vec::new(),
            working_directory: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Switch to stdin streaming with the given timeout.
    pub fn via_stdin(mut self, timeout: Duration) -> Self {
        self.delivery = Delivery::Stdin;
        self.timeout = timeout;
        self
    }

    pub fn with_target(mut self, target: ExecutionTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }
}

/// Captured outcome of a process that ran to exit.
///
/// The engine does not interpret output; see
/// [`extractor`](crate::extractor) for that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub output: String,
    pub error_output: String,
    /// Process exit code (`-1` if killed by signal).
    pub exit_code: i32,
    /// `exit_code == 0`.
    pub successful: bool,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn new(output: String, error_output: String, exit_code: i32, duration_ms: u64) -> Self {
        Self {
            output,
            error_output,
            exit_code,
            successful: exit_code == 0,
            duration_ms,
        }
    }

    /// Human-readable failure summary: stderr when present, else the exit code.
    pub fn failure_message(&self) -> String {
        let stderr = self.error_output.trim();
        if stderr.is_empty() {
            format!("Script exited with code {}", self.exit_code)
        } else {
            format!("Script exited with code {}: {stderr}", self.exit_code)
        }
    }
}

/// Errors that prevent a script from running to exit.
///
/// A non-zero exit code is not an error here; it is a normal
/// [`ExecutionResult`] with `successful == false`.
#[derive(Debug)]
pub enum ScriptError {
    /// The script exceeded its configured timeout and was killed.
    Timeout {
        /// Elapsed wall-clock time before the process was killed.
        elapsed_ms: u64,
    },
    /// An I/O error occurred while staging, spawning or communicating with
    /// the process.
    IoError(std::io::Error),
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed_ms } => {
                write!(f, "Script timed out after {elapsed_ms}ms")
            }
            Self::IoError(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for ScriptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(err) => Some(err),
            Self::Timeout { .. } => None,
        }
    }
}

impl From<std::io::Error> for ScriptError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err)
    }
}

/// The execution engine seam.
///
/// Implemented by [`ShellExecutor`](super::shell::ShellExecutor) in
/// production and by scripted fakes in pipeline tests.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Run `input` to completion or timeout.
    async fn execute(&self, input: ScriptInput) -> Result<ExecutionResult, ScriptError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
