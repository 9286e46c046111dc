//! Code rollout as an ordered list of named steps.
//!
//! A step is either fatal or advisory. A fatal failure skips every later
//! step; an advisory failure is logged and the plan continues.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::RolloutConfig;
use crate::container::ContainerRuntime;
use crate::executor::{CommandExecutor, ExecutionCommand};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Fatal,
    Advisory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        })
    }
}

#[derive(Debug, Clone)]
pub enum StepAction {
    /// Run an external command; nonzero exit fails the step
    Command(ExecutionCommand),
    /// Create missing tables
    Migrate,
    /// Rebuild or pull the given image
    RebuildImage(String),
}

#[derive(Debug, Clone)]
pub struct RolloutStep {
    pub name: String,
    pub severity: Severity,
    pub action: StepAction,
}

impl RolloutStep {
    pub fn new(name: impl Into<String>, severity: Severity, action: StepAction) -> Self {
        Self {
            name: name.into(),
            severity,
            action,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub severity: Severity,
    pub status: StepStatus,
    pub output: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutReport {
    pub steps: Vec<StepReport>,
}

impl RolloutReport {
    /// True unless a fatal step failed
    pub fn succeeded(&self) -> bool {
        !self
            .steps
            .iter()
            .any(|s| s.severity == Severity::Fatal && s.status == StepStatus::Failed)
    }

    pub fn status_of(&self, name: &str) -> Option<StepStatus> {
        self.steps.iter().find(|s| s.name == name).map(|s| s.status)
    }
}

/// The standard sequence: pull, migrate, rebuild image, register jobs,
/// restart the service.
pub fn default_plan(config: &RolloutConfig, image: &str) -> Vec<RolloutStep> {
    let timeout = Duration::from_secs(config.step_timeout_secs);
    let mut steps = vec![
        RolloutStep::new(
            "pull",
            Severity::Fatal,
            StepAction::Command(
                ExecutionCommand::new(
                    "git",
                    vec![
                        "-C".to_string(),
                        config.project_dir.display().to_string(),
                        "pull".to_string(),
                        "--ff-only".to_string(),
                        "origin".to_string(),
                        config.branch.clone(),
                    ],
                )
                .with_timeout(timeout),
            ),
        ),
        RolloutStep::new("migrate", Severity::Advisory, StepAction::Migrate),
        RolloutStep::new(
            "rebuild-image",
            Severity::Advisory,
            StepAction::RebuildImage(image.to_string()),
        ),
    ];

    if let Some((program, args)) = config.register_jobs_command.split_first() {
        steps.push(RolloutStep::new(
            "register-jobs",
            Severity::Advisory,
            StepAction::Command(
                ExecutionCommand::new(program.clone(), args.to_vec()).with_timeout(timeout),
            ),
        ));
    }

    steps.push(RolloutStep::new(
        "restart-service",
        Severity::Advisory,
        StepAction::Command(
            ExecutionCommand::new(
                "systemctl",
                vec!["restart".to_string(), config.service_name.clone()],
            )
            .with_timeout(timeout),
        ),
    ));
    steps
}

pub struct RolloutRunner {
    executor: Arc<dyn CommandExecutor>,
    store: Option<Store>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
}

impl RolloutRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            store: None,
            runtime: None,
        }
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub async fn run(&self, steps: &[RolloutStep]) -> RolloutReport {
        let mut report = RolloutReport::default();
        let mut halted = false;

        for step in steps {
            if halted {
                info!("Skipping rollout step {}", step.name);
                report.steps.push(StepReport {
                    name: step.name.clone(),
                    severity: step.severity,
                    status: StepStatus::Skipped,
                    output: String::new(),
                });
                continue;
            }

            info!("Running rollout step {}", step.name);
            let (status, output) = match self.execute(&step.action).await {
                Ok(output) => (StepStatus::Succeeded, output),
                Err(output) => (StepStatus::Failed, output),
            };

            if status == StepStatus::Failed {
                match step.severity {
                    Severity::Fatal => {
                        warn!("Fatal rollout step {} failed: {}", step.name, output);
                        halted = true;
                    }
                    Severity::Advisory => {
                        warn!("Rollout step {} failed, continuing: {}", step.name, output)
                    }
                }
            }

            report.steps.push(StepReport {
                name: step.name.clone(),
                severity: step.severity,
                status,
                output,
            });
        }
        report
    }

    /// Captured output on success, a failure description otherwise.
    async fn execute(&self, action: &StepAction) -> Result<String, String> {
        match action {
            StepAction::Command(cmd) => {
                let result = self
                    .executor
                    .execute(cmd.clone())
                    .await
                    .map_err(|e| e.to_string())?;
                let output = format!("{}{}", result.stdout, result.stderr);
                if result.success() {
                    Ok(output)
                } else {
                    Err(format!("{}: {}", cmd.display_line(), result.summary()))
                }
            }
            StepAction::Migrate => match &self.store {
                Some(store) => store
                    .migrate()
                    .await
                    .map(|_| "schema up to date".to_string())
                    .map_err(|e| e.to_string()),
                None => Err("no store configured".to_string()),
            },
            StepAction::RebuildImage(image) => match &self.runtime {
                Some(runtime) => runtime
                    .rebuild_image(image)
                    .await
                    .map(|_| format!("image {} ready", image))
                    .map_err(|e| e.to_string()),
                None => Err("no container runtime available".to_string()),
            },
        }
    }
}
