//! Server image builds.
//!
//! Builds go through the `docker` CLI rather than the API, so the build
//! context never has to be streamed as a tarball. The command runs on a
//! [`CommandExecutor`] and its output is captured for later inspection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::container::{ContainerError, Result};
use crate::executor::{CommandExecutor, ExecutionCommand, ExecutionResult, append_command_log};

/// Image builder for the server image.
#[derive(Clone)]
pub struct ImageBuilder {
    executor: Arc<dyn CommandExecutor>,
    /// CLI binary, `docker` or `podman`
    program: String,
    context: PathBuf,
    timeout: Duration,
    log_path: Option<PathBuf>,
}

impl ImageBuilder {
    pub fn new(executor: Arc<dyn CommandExecutor>, context: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            program: "docker".to_string(),
            context: context.into(),
            timeout: Duration::from_secs(1800),
            log_path: None,
        }
    }

    /// Use another CLI, e.g. `podman`
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Append build output to this file
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn context(&self) -> &Path {
        &self.context
    }

    fn build_command(&self, tag: &str) -> ExecutionCommand {
        let mut cmd = ExecutionCommand::new(
            &self.program,
            vec![
                "build".to_string(),
                "-t".to_string(),
                tag.to_string(),
                "-f".to_string(),
                self.context.join("Dockerfile").display().to_string(),
                self.context.display().to_string(),
            ],
        );
        cmd.timeout = Some(self.timeout);
        cmd
    }

    /// Build `tag` from the Dockerfile in the build context.
    ///
    /// # Errors
    ///
    /// Returns error if the context has no Dockerfile, the CLI cannot be run,
    /// or the build exits nonzero.
    pub async fn build(&self, tag: &str) -> Result<ExecutionResult> {
        if !self.context.join("Dockerfile").is_file() {
            return Err(ContainerError::ConfigError(format!(
                "No Dockerfile in build context {}",
                self.context.display()
            )));
        }

        info!("Building image {} from {}", tag, self.context.display());
        let cmd = self.build_command(tag);
        let result = self
            .executor
            .execute(cmd.clone())
            .await
            .map_err(|e| ContainerError::ExecutionError(format!("{} build: {}", self.program, e)))?;

        if let Some(log_path) = &self.log_path
            && let Err(e) = append_command_log(log_path, &cmd, &result).await
        {
            debug!("Could not write build log {}: {}", log_path.display(), e);
        }

        if !result.success() {
            return Err(ContainerError::ExecutionError(format!(
                "Image build failed: {}",
                result.summary()
            )));
        }

        info!("Successfully built image: {}", tag);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Recording {
        calls: Mutex<Vec<ExecutionCommand>>,
        exit_code: i32,
    }

    #[async_trait]
    impl CommandExecutor for Recording {
        async fn execute(
            &self,
            cmd: ExecutionCommand,
        ) -> std::result::Result<ExecutionResult, ExecutorError> {
            self.calls.lock().unwrap().push(cmd);
            if self.exit_code == 0 {
                Ok(ExecutionResult::ok("built"))
            } else {
                Ok(ExecutionResult::failed(self.exit_code, "no space left"))
            }
        }

        fn executor_type(&self) -> &'static str {
            "recording"
        }
    }

    fn context_with_dockerfile() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_build_invokes_cli() {
        let ctx = context_with_dockerfile();
        let exec = Arc::new(Recording {
            calls: Mutex::new(Vec::new()),
            exit_code: 0,
        });
        let builder = ImageBuilder::new(exec.clone(), ctx.path())
            .with_log_path(ctx.path().join("logs").join("build.log"));

        builder.build("gamefleet/ark-server:latest").await.unwrap();

        let calls = exec.calls.lock().unwrap();
        assert_eq!(calls[0].program, "docker");
        assert_eq!(&calls[0].args[..3], &["build", "-t", "gamefleet/ark-server:latest"]);
        assert!(ctx.path().join("logs").join("build.log").exists());
    }

    #[tokio::test]
    async fn test_failed_build_reported() {
        let ctx = context_with_dockerfile();
        let exec = Arc::new(Recording {
            calls: Mutex::new(Vec::new()),
            exit_code: 1,
        });
        let result = ImageBuilder::new(exec, ctx.path()).build("x:latest").await;
        assert!(matches!(result, Err(ContainerError::ExecutionError(_))));
    }

    #[tokio::test]
    async fn test_missing_dockerfile() {
        let ctx = TempDir::new().unwrap();
        let exec = Arc::new(Recording {
            calls: Mutex::new(Vec::new()),
            exit_code: 0,
        });
        let result = ImageBuilder::new(exec.clone(), ctx.path()).build("x:latest").await;
        assert!(matches!(result, Err(ContainerError::ConfigError(_))));
        assert!(exec.calls.lock().unwrap().is_empty());
    }
}
