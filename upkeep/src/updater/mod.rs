pub mod archive;
pub mod artifacts;
pub mod audit;
pub mod backup;
pub mod cache;
pub mod check;
pub mod checks;
pub mod deployments;
pub mod fsutil;
pub mod health;
pub mod history;
pub mod lock;
pub mod maintenance;
pub mod orchestrator;
pub mod rollback;
pub mod state_machine;
pub mod system;
pub mod versions;

#[cfg(test)]
mod tests;

use crate::{
    conf,
    storage::{self, Db, StorageError},
};
use anyhow::{Context, Result};
use artifacts::{ArtifactDownloader, DownloadError};
use audit::{AuditSink, TracingAuditSink};
use backup::{BackupService, DatabaseHooks, DirectoryBackupService};
use cache::{Cache, MemoryCache};
use check::{UpdateChecker, UpdateInfo, REASON_UP_TO_DATE};
use checks::{CheckSettings, Checks};
use deployments::{Deployment, Status};
use health::{HealthProbe, HttpHealthProbe};
use history::{DeploymentHistory, HistoryError};
use lock::DeploymentLock;
use maintenance::{CommandMaintenanceRunner, MaintenanceRunner};
use orchestrator::{DeployError, DeploymentRequest, Orchestrator, OrchestratorDeps, OrchestratorSettings};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use system::{LocalSystemProbe, SystemProbe};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Return the current epoch time in milliseconds.
pub fn epoch_milli() -> u64 {
    let current_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or_default();

    u64::try_from(current_epoch).unwrap_or(u64::MAX)
}

/// The pluggable pieces of the pipeline.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub cache: Arc<dyn Cache>,
    pub backups: Arc<dyn BackupService>,
    pub maintenance: Arc<dyn MaintenanceRunner>,
    pub health: Arc<dyn HealthProbe>,
    pub system: Arc<dyn SystemProbe>,
    pub audit: Arc<dyn AuditSink>,
}

impl Collaborators {
    /// The built-in implementations, configured for the local installation.
    pub fn from_config(conf: &conf::Config) -> Result<Self> {
        let health = HttpHealthProbe::new(&conf.health.url, conf.health.timeout())
            .context("Could not create health probe")?;

        let runs_migrations = conf
            .maintenance
            .commands
            .iter()
            .any(|command| command.contains("migrate"));

        if runs_migrations && !conf.backup.backs_up_database() {
            warn!("Maintenance runs migrations but no database dump command is configured; rollbacks will restore files only");
        }

        let backups = DirectoryBackupService::new(
            conf.paths.install_root(),
            conf.paths.storage_root(),
            conf.paths.backups_dir(),
        )
        .with_database(DatabaseHooks {
            dump_command: conf.backup.database_dump_command.clone(),
            restore_command: conf.backup.database_restore_command.clone(),
        });

        Ok(Self {
            cache: Arc::new(MemoryCache::new()),
            backups: Arc::new(backups),
            maintenance: Arc::new(CommandMaintenanceRunner::new(
                conf.paths.install_root(),
                conf.maintenance.commands.clone(),
            )),
            health: Arc::new(health),
            system: Arc::new(LocalSystemProbe),
            audit: Arc::new(TracingAuditSink),
        })
    }
}

/// Result of a combined check, download and deploy.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// Nothing to deploy; the update info says why.
    NoUpdate(UpdateInfo),

    /// An update exists but its archive could not be downloaded or failed verification. No deployment was started.
    DownloadFailed {
        info: UpdateInfo,
        error: DownloadError,
    },

    Deployed(Deployment),
}

/// What an operator wants to know at a glance.
#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub current_version: String,

    /// Epoch milliseconds of the last successful update check, if any.
    pub last_checked: Option<u64>,

    /// The cached result of the last check, while it is still fresh.
    pub last_check: Option<UpdateInfo>,

    pub last_deployment: Option<Deployment>,
    pub deployment_running: bool,
}

/// Entry point for checking, downloading and deploying updates.
#[derive(Debug, Clone)]
pub struct Updater {
    storage: Db,
    checker: UpdateChecker,
    downloader: ArtifactDownloader,
    orchestrator: Orchestrator,
    history: DeploymentHistory,
}

impl Updater {
    pub async fn new(conf: conf::Config) -> Result<Self> {
        let storage = Db::new(&conf.storage.database_path)
            .await
            .with_context(|| {
                format!(
                    "Could not open database at '{}'",
                    conf.storage.database_path
                )
            })?;

        let collaborators = Collaborators::from_config(&conf)?;

        Self::with_collaborators(conf, storage, collaborators).await
    }

    pub async fn with_collaborators(
        conf: conf::Config,
        storage: Db,
        collaborators: Collaborators,
    ) -> Result<Self> {
        seed_current_version(&storage, &conf.general.app_version).await?;

        let checker = UpdateChecker::new(
            &conf.feed.url,
            &conf.feed.app_key,
            conf.feed.check_timeout(),
            collaborators.cache.clone(),
            conf.feed.cache_ttl(),
        )
        .context("Could not create update checker")?;

        let downloader = ArtifactDownloader::new(conf.paths.updates_dir(), conf.download.timeout())
            .context("Could not create artifact downloader")?;

        let history = DeploymentHistory::new(storage.clone(), conf.deployment.history_retention);

        let checks = Checks::new(
            CheckSettings {
                runtime_version: conf.general.runtime_version.clone(),
                min_free_disk_bytes: conf.deployment.min_free_disk_bytes(),
                install_root: conf.paths.install_root(),
                storage_root: conf.paths.storage_root(),
                public_root: conf.paths.public_root(),
                critical_files: conf.deployment.critical_files.clone(),
            },
            collaborators.system.clone(),
            collaborators.health.clone(),
        );

        let orchestrator = Orchestrator::new(
            OrchestratorSettings {
                install_root: conf.paths.install_root(),
                updates_dir: conf.paths.updates_dir(),
                backup_attempts: conf.deployment.backup_attempts,
                step_timeout: conf.deployment.step_timeout(),
            },
            OrchestratorDeps {
                storage: storage.clone(),
                history: history.clone(),
                lock: DeploymentLock::new(),
                checks,
                backups: collaborators.backups,
                maintenance: collaborators.maintenance,
                audit: collaborators.audit,
            },
        );

        Ok(Self {
            storage,
            checker,
            downloader,
            orchestrator,
            history,
        })
    }

    pub async fn current_version(&self) -> Result<String, StorageError> {
        let mut conn = self.storage.read_conn().await?;
        let system = storage::system::get_system_parameters(&mut conn).await?;

        Ok(system.current_version)
    }

    /// Asks the update feed whether a newer version exists. Feed problems are reported inside the returned info.
    pub async fn check(&self, force: bool) -> Result<UpdateInfo, StorageError> {
        let current_version = self.current_version().await?;
        let info = self.checker.check(&current_version, force).await;

        let reached_feed = info.reason.is_none() || info.reason.as_deref() == Some(REASON_UP_TO_DATE);

        if reached_feed {
            if let Err(e) = self.record_check_time(info.checked_at).await {
                warn!(error = %e, "Could not record update check time");
            }
        }

        Ok(info)
    }

    async fn record_check_time(&self, checked_at: u64) -> Result<(), StorageError> {
        let mut conn = self.storage.write_conn().await?;
        storage::system::update_system_parameters(&mut conn, None, Some(checked_at.to_string())).await
    }

    /// Checks for an update and, if one is available, downloads, verifies and deploys it.
    pub async fn update(
        &self,
        force_check: bool,
        cancel: CancellationToken,
    ) -> Result<UpdateOutcome, DeployError> {
        let info = self.check(force_check).await?;

        if !info.available {
            return Ok(UpdateOutcome::NoUpdate(info));
        }

        // No point downloading what we would not be allowed to deploy.
        if self.orchestrator.is_running() {
            return Err(DeployError::DeploymentAlreadyRunning);
        }

        let artifact = match self.downloader.fetch(&info).await {
            Ok(artifact) => artifact,
            Err(error) => {
                warn!(
                    version = ?info.latest_version,
                    error = %error,
                    "Could not download update"
                );
                return Ok(UpdateOutcome::DownloadFailed { info, error });
            }
        };

        let archive_path = artifact.local_path.clone();

        let request = DeploymentRequest {
            target_version: info.latest_version.clone().unwrap_or_default(),
            minimum_runtime_version: info.minimum_runtime_version.clone(),
            artifact,
        };

        match self.deploy(request, cancel).await {
            Ok(deployment) => Ok(UpdateOutcome::Deployed(deployment)),
            Err(e) => {
                // A rejected deployment never got to clean up the archive itself.
                if !matches!(e, DeployError::RecordNotPersisted { .. }) {
                    if let Err(remove_err) = fsutil::remove_path(&archive_path) {
                        warn!(error = %remove_err, "Could not remove downloaded archive");
                    }
                }
                Err(e)
            }
        }
    }

    /// Deploys an already verified artifact.
    pub async fn deploy(
        &self,
        request: DeploymentRequest,
        cancel: CancellationToken,
    ) -> Result<Deployment, DeployError> {
        let deployment = self.orchestrator.deploy(request, cancel).await?;

        if deployment.status == Status::Succeeded {
            self.checker.invalidate();
        }

        Ok(deployment)
    }

    /// Closes out a deployment left `in_progress` by a process that is no longer running. Returns the closed
    /// record, or None if nothing was in progress.
    pub async fn recover(&self, force: bool) -> Result<Option<Deployment>, DeployError> {
        self.orchestrator.recover(force).await
    }

    /// Most recent deployments first.
    pub async fn history(&self, limit: Option<u64>) -> Result<Vec<Deployment>, HistoryError> {
        self.history.list(limit).await
    }

    pub async fn status(&self) -> Result<SystemStatus, HistoryError> {
        let system = {
            let mut conn = self.storage.read_conn().await?;
            storage::system::get_system_parameters(&mut conn).await?
        };

        let last_checked = match system.last_checked.parse::<u64>() {
            Ok(0) | Err(_) => None,
            Ok(checked) => Some(checked),
        };

        let in_progress = self.history.in_progress().await?;

        Ok(SystemStatus {
            current_version: system.current_version,
            last_checked,
            last_check: self.checker.last_result(),
            last_deployment: self.history.latest().await?,
            deployment_running: self.orchestrator.is_running() || in_progress.is_some(),
        })
    }
}

/// The database only learns the installed version from configuration once; afterwards deployments own it.
async fn seed_current_version(storage: &Db, app_version: &str) -> Result<()> {
    let mut conn = storage.write_conn().await?;
    let system = storage::system::get_system_parameters(&mut conn).await?;

    if system.current_version.is_empty() {
        storage::system::update_system_parameters(&mut conn, Some(app_version.into()), None)
            .await
            .context("Could not record initial application version")?;

        info!(version = %app_version, "Recorded initial application version");
    }

    Ok(())
}
