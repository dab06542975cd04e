use crate::{
    storage::{self, Db, StorageError},
    updater::{
        archive,
        artifacts::Artifact,
        audit::AuditSink,
        backup::BackupService,
        checks::Checks,
        deployments::{Deployment, DeploymentError, Status, Step},
        epoch_milli, fsutil,
        history::{DeploymentHistory, HistoryError},
        lock::{DeploymentLock, Owner},
        maintenance::MaintenanceRunner,
        rollback::RollbackCoordinator,
        state_machine::{self, StepFailure, StepResult, Transition},
    },
};
use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("deployment already running")]
    DeploymentAlreadyRunning,

    #[error("artifact '{0}' has not passed verification")]
    UnverifiedArtifact(String),

    #[error("could not read system state; {0}")]
    Storage(#[from] StorageError),

    #[error("could not access deployment history; {0}")]
    History(#[from] HistoryError),

    /// The deployment ran to a terminal state but the final record could not be written.
    #[error("deployment '{}' finished as {} but could not be recorded; {source}", deployment.deployment_id, deployment.status)]
    RecordNotPersisted {
        deployment: Box<Deployment>,
        #[source]
        source: HistoryError,
    },
}

/// A verified artifact ready to be deployed.
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    pub target_version: String,

    /// Minimum runtime version the new release needs. Empty means no requirement.
    pub minimum_runtime_version: String,

    pub artifact: Artifact,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub install_root: PathBuf,

    /// Where archives are downloaded to and staging directories are created in.
    pub updates_dir: PathBuf,

    /// How many times backup creation is attempted before the deployment fails.
    pub backup_attempts: u32,

    pub step_timeout: Duration,
}

/// Everything the orchestrator talks to outside of its own state.
#[derive(Debug, Clone)]
pub struct OrchestratorDeps {
    pub storage: Db,
    pub history: DeploymentHistory,
    pub lock: DeploymentLock,
    pub checks: Checks,
    pub backups: Arc<dyn BackupService>,
    pub maintenance: Arc<dyn MaintenanceRunner>,
    pub audit: Arc<dyn AuditSink>,
}

/// Runs deployments through the fixed step order, rolling back destructive failures. Only one deployment may run
/// at a time; others are rejected immediately.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    settings: OrchestratorSettings,
    storage: Db,
    history: DeploymentHistory,
    lock: DeploymentLock,
    checks: Checks,
    backups: Arc<dyn BackupService>,
    rollback: RollbackCoordinator,
    maintenance: Arc<dyn MaintenanceRunner>,
    audit: Arc<dyn AuditSink>,

    /// Written to every record this orchestrator starts.
    owner: Owner,
}

/// Message recorded on deployments whose owning process died before they finished.
pub const INTERRUPTED_MESSAGE: &str = "interrupted; manual check required";

/// Per-run state shared between steps.
struct Run<'a> {
    request: &'a DeploymentRequest,
    staging: PathBuf,
}

impl Orchestrator {
    pub fn new(settings: OrchestratorSettings, deps: OrchestratorDeps) -> Self {
        Self {
            settings,
            storage: deps.storage,
            history: deps.history,
            lock: deps.lock,
            checks: deps.checks,
            rollback: RollbackCoordinator::new(deps.backups.clone()),
            backups: deps.backups,
            maintenance: deps.maintenance,
            audit: deps.audit,
            owner: Owner::current(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock.is_held()
    }

    #[cfg(test)]
    pub fn set_step_timeout(&mut self, timeout: Duration) {
        self.settings.step_timeout = timeout;
    }

    /// Closes out an `in_progress` record whose owner is gone, so deployments can run again. Owners whose liveness
    /// cannot be determined (another host, unreadable owner) are only closed out when `force` is set. Returns the
    /// closed record, or None if nothing was in progress.
    pub async fn recover(&self, force: bool) -> Result<Option<Deployment>, DeployError> {
        let Some(_guard) = self.lock.try_acquire() else {
            return Err(DeployError::DeploymentAlreadyRunning);
        };

        let Some(running) = self.history.in_progress().await? else {
            return Ok(None);
        };

        match self.close_interrupted(running, force).await? {
            Some(closed) => Ok(Some(closed)),
            None => Err(DeployError::DeploymentAlreadyRunning),
        }
    }

    /// Marks `running` as failed if its owner is no longer alive. Returns None, leaving the record alone, while the
    /// owner may still be working on it. Callers must hold the deployment lock.
    async fn close_interrupted(
        &self,
        running: Deployment,
        force: bool,
    ) -> Result<Option<Deployment>, DeployError> {
        let owner = Owner::from_str(&running.owner).ok();

        let alive = match &owner {
            // The in-process lock is held, so nothing in this process is still working on it.
            Some(owner) if *owner == self.owner => Some(false),
            Some(owner) => owner.is_alive(&self.owner),
            None => None,
        };

        let reason = match alive {
            Some(false) => format!("owning process {} is no longer running", running.owner),
            None if force => format!("owner '{}' could not be checked; closed by operator", running.owner),
            _ => {
                warn!(
                    deployment_id = %running.deployment_id,
                    owner = %running.owner,
                    "Deployment in progress elsewhere"
                );
                return Ok(None);
            }
        };

        let mut closed = running;
        closed.status = Status::Failed;
        closed.ended = epoch_milli();

        let mut details = vec![reason];
        if let Some(backup_id) = &closed.backup_id {
            details.push(format!("backup {backup_id} is available for a manual restore"));
        }

        closed.error = Some(DeploymentError {
            step: closed.current_step,
            message: INTERRUPTED_MESSAGE.into(),
            details,
            rollback_failed: false,
            rollback_error: None,
        });

        error!(
            deployment_id = %closed.deployment_id,
            step = %closed.current_step,
            owner = %closed.owner,
            backup_id = ?closed.backup_id,
            "Closing interrupted deployment; installation may be partially updated"
        );

        self.audit.record(&closed);
        self.history.finish(&closed).await?;

        Ok(Some(self.history.get(&closed.deployment_id).await?))
    }

    /// Deploys the requested artifact and returns the terminal deployment record. Rejects the request without
    /// touching anything if another deployment is running or the artifact is unverified.
    #[instrument(skip_all, fields(target_version = %request.target_version))]
    pub async fn deploy(
        &self,
        request: DeploymentRequest,
        cancel: CancellationToken,
    ) -> Result<Deployment, DeployError> {
        if !request.artifact.verified {
            return Err(DeployError::UnverifiedArtifact(
                request.artifact.local_path.display().to_string(),
            ));
        }

        let Some(_guard) = self.lock.try_acquire() else {
            return Err(DeployError::DeploymentAlreadyRunning);
        };

        // Another process may be deploying against the same database, or may have died while doing so.
        if let Some(running) = self.history.in_progress().await? {
            if self.close_interrupted(running, false).await?.is_none() {
                return Err(DeployError::DeploymentAlreadyRunning);
            }
        }

        let start_version = {
            let mut conn = self.storage.read_conn().await?;
            storage::system::get_system_parameters(&mut conn)
                .await?
                .current_version
        };

        let mut deployment = Deployment::new(&start_version, &request.target_version);
        deployment.status = Status::InProgress;
        deployment.owner = self.owner.to_string();

        match self.history.begin(&deployment).await {
            Ok(_) => {}
            Err(HistoryError::Storage(StorageError::Exists)) => {
                return Err(DeployError::DeploymentAlreadyRunning)
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            deployment_id = %deployment.deployment_id,
            start_version = %deployment.start_version,
            target_version = %deployment.target_version,
            "Starting deployment"
        );

        let run = Run {
            request: &request,
            staging: archive::staging_dir(
                &self.settings.updates_dir,
                epoch_milli(),
                &deployment.deployment_id,
            ),
        };

        self.drive(&mut deployment, &run, &cancel).await;

        self.cleanup(&run).await;

        deployment.ended = epoch_milli();
        self.audit.record(&deployment);

        if let Err(source) = self.history.finish(&deployment).await {
            error!(
                deployment_id = %deployment.deployment_id,
                status = %deployment.status,
                error = %source,
                "Could not record terminal deployment state"
            );
            return Err(DeployError::RecordNotPersisted {
                deployment: Box::new(deployment),
                source,
            });
        }

        Ok(deployment)
    }

    /// Steps through the state machine until the deployment reaches a terminal status.
    async fn drive(&self, deployment: &mut Deployment, run: &Run<'_>, cancel: &CancellationToken) {
        let mut step = Step::Precheck;

        loop {
            deployment.current_step = step;

            let outcome = self.attempt(step, deployment, run, cancel).await;

            if let Err(failure) = &outcome {
                warn!(
                    deployment_id = %deployment.deployment_id,
                    step = %step,
                    error = %failure.message,
                    "Deployment step failed"
                );
            }

            match state_machine::next(step, &outcome, deployment.backup_id.is_some()) {
                Transition::Advance(next) => {
                    debug!(deployment_id = %deployment.deployment_id, from = %step, to = %next, "Advancing deployment");
                    step = next;
                }
                Transition::Complete => {
                    deployment.status = Status::Succeeded;
                    info!(
                        deployment_id = %deployment.deployment_id,
                        version = %deployment.target_version,
                        "Deployment succeeded"
                    );
                    return;
                }
                Transition::Fail => {
                    deployment.status = Status::Failed;
                    deployment.error = Some(to_deployment_error(step, outcome));
                    return;
                }
                Transition::RollBack => {
                    let mut err = to_deployment_error(step, outcome);
                    let backup_id = deployment.backup_id.clone().unwrap_or_default();

                    match self.rollback.rollback(&backup_id).await {
                        Ok(_) => {
                            deployment.status = Status::RolledBack;
                            info!(deployment_id = %deployment.deployment_id, backup_id = %backup_id, "Deployment rolled back");
                        }
                        Err(e) => {
                            deployment.status = Status::Failed;
                            err.rollback_failed = true;
                            err.rollback_error = Some(e.to_string());
                            error!(
                                deployment_id = %deployment.deployment_id,
                                backup_id = %backup_id,
                                error = %e,
                                "Rollback failed; installation may be partially updated"
                            );
                        }
                    }

                    deployment.error = Some(err);
                    return;
                }
            }
        }
    }

    /// Runs a single step under the step timeout, recording progress first. A step that overruns is told to stop
    /// and awaited until it has, so nothing it started is still writing once this returns.
    async fn attempt(
        &self,
        step: Step,
        deployment: &mut Deployment,
        run: &Run<'_>,
        cancel: &CancellationToken,
    ) -> StepResult {
        // Past the backup point the only way out is forward or rollback.
        if step <= Step::Backup && cancel.is_cancelled() {
            return Err(StepFailure::new("cancelled"));
        }

        if step != Step::Precheck {
            self.history
                .advance(deployment)
                .await
                .map_err(|e| StepFailure::new(format!("could not record progress; {e}")))?;
        }

        let timeout = self.settings.step_timeout;
        let deployment_id = deployment.deployment_id.clone();
        let stop = CancellationToken::new();

        let work = self.run_step(step, deployment, run, &stop);
        tokio::pin!(work);

        tokio::select! {
            biased;
            outcome = &mut work => return outcome,
            _ = tokio::time::sleep(timeout) => {}
        }

        stop.cancel();
        warn!(deployment_id = %deployment_id, step = %step, "Step timed out; waiting for it to stop");

        if let Err(failure) = work.await {
            debug!(deployment_id = %deployment_id, error = %failure.message, "Timed out step stopped");
        }

        Err(StepFailure::new(format!(
            "step timed out after {}",
            describe_timeout(timeout)
        )))
    }

    async fn run_step(
        &self,
        step: Step,
        deployment: &mut Deployment,
        run: &Run<'_>,
        stop: &CancellationToken,
    ) -> StepResult {
        match step {
            Step::Precheck => {
                tokio::select! {
                    outcome = self.checks.precheck(&run.request.minimum_runtime_version) => outcome,
                    _ = stop.cancelled() => Err(StepFailure::new("precheck stopped")),
                }
            }
            Step::Backup => {
                let backup_id = self.backup(stop).await?;
                deployment.backup_id = Some(backup_id);
                Ok(())
            }
            Step::Extract => self.extract(run, stop).await,
            Step::Apply => self.apply(run, stop).await,
            Step::PostDeploy => self.post_deploy(stop).await,
            Step::Verify => {
                tokio::select! {
                    outcome = self.checks.verify(&run.request.target_version) => outcome,
                    _ = stop.cancelled() => Err(StepFailure::new("verification stopped")),
                }
            }
            Step::Done => self.finalize(&run.request.target_version).await,
        }
    }

    async fn backup(&self, stop: &CancellationToken) -> Result<String, StepFailure> {
        let attempts = self.settings.backup_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if stop.is_cancelled() {
                break;
            }

            match self.backups.create_backup(stop).await {
                Ok(backup_id) => return Ok(backup_id),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Backup attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(StepFailure::new(format!(
            "backup failed after {attempts} attempt(s); {last_error}"
        )))
    }

    async fn extract(&self, run: &Run<'_>, stop: &CancellationToken) -> StepResult {
        let archive_path = run.request.artifact.local_path.clone();
        let staging = run.staging.clone();
        let stop = stop.clone();

        let entries = tokio::task::spawn_blocking(move || archive::extract(&archive_path, &staging, &stop))
            .await
            .map_err(|e| StepFailure::new(format!("extract task did not complete; {e}")))?
            .map_err(|e| StepFailure::new(format!("could not extract update archive; {e}")))?;

        debug!(entries, staging = %run.staging.display(), "Extracted update archive");
        Ok(())
    }

    async fn apply(&self, run: &Run<'_>, stop: &CancellationToken) -> StepResult {
        let staging = run.staging.clone();
        let install_root = self.settings.install_root.clone();
        let stop = stop.clone();

        let copied = tokio::task::spawn_blocking(move || fsutil::copy_tree(&staging, &install_root, &[], &stop))
            .await
            .map_err(|e| StepFailure::new(format!("apply task did not complete; {e}")))?
            .map_err(|e| StepFailure::new(format!("could not apply update files; {e}")))?;

        debug!(files = copied, "Applied update files");
        Ok(())
    }

    async fn post_deploy(&self, stop: &CancellationToken) -> StepResult {
        let report = self
            .maintenance
            .run(stop)
            .await
            .map_err(|e| StepFailure::new(format!("could not run maintenance tasks; {e}")))?;

        let Some(failed) = report.first_failure() else {
            return Ok(());
        };

        let code = failed
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "none".into());

        let details = if failed.output.is_empty() {
            vec![]
        } else {
            vec![failed.output.clone()]
        };

        Err(StepFailure::with_details(
            format!("maintenance task '{}' failed with exit code {code}", failed.task),
            details,
        ))
    }

    async fn finalize(&self, target_version: &str) -> StepResult {
        let mut conn = self
            .storage
            .write_conn()
            .await
            .map_err(|e| StepFailure::new(format!("could not record current version; {e}")))?;

        storage::system::update_system_parameters(&mut conn, Some(target_version.into()), None)
            .await
            .map_err(|e| StepFailure::new(format!("could not record current version; {e}")))
    }

    /// Removes the staging directory and the downloaded archive. Failures are logged and otherwise ignored.
    async fn cleanup(&self, run: &Run<'_>) {
        let paths = vec![run.staging.clone(), run.request.artifact.local_path.clone()];

        let result = tokio::task::spawn_blocking(move || {
            for path in paths {
                if let Err(e) = fsutil::remove_path(&path) {
                    error!(path = %path.display(), error = %e, "Could not clean up deployment files");
                }
            }
        })
        .await;

        if let Err(e) = result {
            error!(error = %e, "Cleanup task did not complete");
        }
    }
}

fn describe_timeout(timeout: Duration) -> String {
    if timeout.as_secs() > 0 {
        format!("{}s", timeout.as_secs())
    } else {
        format!("{}ms", timeout.as_millis())
    }
}

fn to_deployment_error(step: Step, outcome: StepResult) -> DeploymentError {
    let failure = match outcome {
        Ok(_) => StepFailure::new("step failed"),
        Err(failure) => failure,
    };

    DeploymentError {
        step,
        message: failure.message,
        details: failure.details,
        rollback_failed: false,
        rollback_error: None,
    }
}
