//! # External Command Execution
//!
//! SteamCMD downloads, image builds and rollout steps all run external
//! programs. They go through the [`CommandExecutor`] trait so that the
//! components invoking them can be exercised against scripted executors.
//!
//! ## Core Components
//!
//! - **[`CommandExecutor`]**: async trait implemented by every executor
//! - **[`HostExecutor`]**: runs processes on the host via `tokio::process::Command`
//! - **[`ExecutionCommand`]**: program, arguments, environment, stdin and timeout
//! - **[`ExecutionResult`]**: stdout, stderr, exit code and duration
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use gamefleet::executor::{CommandExecutor, ExecutionCommand, HostExecutor};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = HostExecutor::new();
//!
//!     let command = ExecutionCommand::new("steamcmd", vec!["+quit".to_string()])
//!         .with_timeout(Duration::from_secs(60));
//!
//!     let result = executor.execute(command).await?;
//!     println!("Exit code: {}", result.exit_code);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host-based command execution.
///
/// Implements [`HostExecutor`] for direct process execution on the
/// host system using `tokio::process::Command`.
pub mod host;

pub use host::HostExecutor;

/// Result of command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Exit code (0 = success, non-zero = failure)
    pub exit_code: i32,
    /// Duration of command execution
    pub duration: Duration,
}

impl ExecutionResult {
    /// Check if the command executed successfully (exit code 0)
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Successful result with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
            duration: Duration::ZERO,
        }
    }

    /// Failed result with the given exit code and stderr
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
            duration: Duration::ZERO,
        }
    }

    /// Last non-empty line of stderr, falling back to stdout
    pub fn summary(&self) -> String {
        self.stderr
            .lines()
            .chain(self.stdout.lines())
            .filter(|l| !l.trim().is_empty())
            .last()
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| format!("exit code {}", self.exit_code))
    }
}

/// Command to execute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCommand {
    /// Program name or path to execute
    pub program: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Working directory for command execution
    pub working_dir: Option<PathBuf>,
    /// Environment variables to set
    pub env: HashMap<String, String>,
    /// Standard input to provide to the command
    pub stdin: Option<String>,
    /// Maximum execution time (None = no timeout)
    pub timeout: Option<Duration>,
}

impl ExecutionCommand {
    /// Create a new command with just program and args
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            env: HashMap::new(),
            stdin: None,
            timeout: None,
        }
    }

    /// Set the working directory
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set standard input
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Set execution timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program and arguments as one line, for logs
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| shell_escape::escape(part.into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Errors during command execution
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Program could not be located
    #[error("Program not found: {0}")]
    NotFound(String),

    /// Command execution failed
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Command execution timed out
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// I/O error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Runs external commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute a command and return the result
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be spawned or times out. A
    /// nonzero exit is reported through [`ExecutionResult::exit_code`].
    async fn execute(&self, cmd: ExecutionCommand) -> Result<ExecutionResult, ExecutorError>;

    /// Get executor type name for logging
    fn executor_type(&self) -> &'static str;
}

/// Append a command and its captured output to `log_path`.
///
/// Creates the parent directory as needed.
pub async fn append_command_log(
    log_path: &Path,
    cmd: &ExecutionCommand,
    result: &ExecutionResult,
) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await?;

    let entry = format!(
        "$ {}\n--- exit code {} after {:?}\n--- stdout\n{}\n--- stderr\n{}\n\n",
        cmd.display_line(),
        result.exit_code,
        result.duration,
        result.stdout,
        result.stderr
    );
    file.write_all(entry.as_bytes()).await?;
    file.flush().await
}
