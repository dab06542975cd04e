use crate::updater::backup::{BackupError, BackupService};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("restore of backup '{backup_id}' failed; {source}")]
    RestoreFailed {
        backup_id: String,
        #[source]
        source: BackupError,
    },
}

/// Restores a backup after a destructive step failed. Makes exactly one restore attempt; retrying is left to an
/// operator.
#[derive(Debug, Clone)]
pub struct RollbackCoordinator {
    backups: Arc<dyn BackupService>,
}

impl RollbackCoordinator {
    pub fn new(backups: Arc<dyn BackupService>) -> Self {
        Self { backups }
    }

    pub async fn rollback(&self, backup_id: &str) -> Result<(), RollbackError> {
        info!(backup_id = %backup_id, "Rolling back to backup");

        self.backups.restore(backup_id).await.map_err(|source| {
            error!(backup_id = %backup_id, error = %source, "Rollback failed; manual intervention required");
            RollbackError::RestoreFailed {
                backup_id: backup_id.into(),
                source,
            }
        })
    }
}
