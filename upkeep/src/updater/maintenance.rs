use async_trait::async_trait;
use std::{fmt::Debug, path::PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("maintenance command at position {0} is empty")]
    EmptyCommand(usize),

    #[error("could not start maintenance command '{command}'; {message}")]
    Spawn { command: String, message: String },

    #[error("maintenance cancelled while running '{0}'")]
    Cancelled(String),
}

/// Outcome of a single maintenance task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub task: String,
    pub success: bool,
    pub exit_code: Option<i32>,

    /// Tail of the task's stderr, or stdout if stderr was empty.
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Results in execution order. Tasks after the first failure are not run and do not appear.
    pub tasks: Vec<TaskResult>,
}

impl MaintenanceReport {
    pub fn first_failure(&self) -> Option<&TaskResult> {
        self.tasks.iter().find(|task| !task.success)
    }
}

/// Runs the application's post-deploy housekeeping (cache clears, migrations, optimization).
#[async_trait]
pub trait MaintenanceRunner: Debug + Send + Sync + 'static {
    /// Runs every task in order. A running task is stopped once `cancel` fires.
    async fn run(&self, cancel: &CancellationToken) -> Result<MaintenanceReport, MaintenanceError>;
}

const OUTPUT_TAIL_CHARS: usize = 2000;

fn tail(output: &[u8]) -> String {
    let output = String::from_utf8_lossy(output);
    let output = output.trim();
    let chars = output.chars().count();

    if chars <= OUTPUT_TAIL_CHARS {
        return output.to_string();
    }

    output.chars().skip(chars - OUTPUT_TAIL_CHARS).collect()
}

/// Runs an ordered list of shell-style commands inside the install root.
#[derive(Debug, Clone)]
pub struct CommandMaintenanceRunner {
    working_dir: PathBuf,
    commands: Vec<String>,
}

impl CommandMaintenanceRunner {
    pub fn new(working_dir: PathBuf, commands: Vec<String>) -> Self {
        Self {
            working_dir,
            commands,
        }
    }
}

#[async_trait]
impl MaintenanceRunner for CommandMaintenanceRunner {
    #[instrument(skip(self, cancel), fields(origin = "updater::maintenance"))]
    async fn run(&self, cancel: &CancellationToken) -> Result<MaintenanceReport, MaintenanceError> {
        let mut report = MaintenanceReport::default();

        for (index, command) in self.commands.iter().enumerate() {
            let mut parts = command.split_whitespace();
            let Some(program) = parts.next() else {
                return Err(MaintenanceError::EmptyCommand(index));
            };

            debug!(command = %command, "Running maintenance task");

            let mut task = tokio::process::Command::new(program);
            task.args(parts)
                .current_dir(&self.working_dir)
                .kill_on_drop(true);

            // Dropping the output future kills the child.
            let output = tokio::select! {
                output = task.output() => output.map_err(|e| MaintenanceError::Spawn {
                    command: command.clone(),
                    message: e.to_string(),
                })?,
                _ = cancel.cancelled() => return Err(MaintenanceError::Cancelled(command.clone())),
            };

            let success = output.status.success();
            let stderr = tail(&output.stderr);

            let result = TaskResult {
                task: command.clone(),
                success,
                exit_code: output.status.code(),
                output: if stderr.is_empty() {
                    tail(&output.stdout)
                } else {
                    stderr
                },
            };

            report.tasks.push(result);

            if !success {
                error!(command = %command, code = ?output.status.code(), "Maintenance task failed");
                break;
            }
        }

        Ok(report)
    }
}
