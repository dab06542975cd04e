use crate::{
    storage::{self, Db, StorageError},
    updater::deployments::Deployment,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("database error occurred; {0}")]
    Storage(#[from] StorageError),

    #[error("could not serialize deployment record; {0}")]
    Serialization(#[source] anyhow::Error),
}

/// Append-only log of deployment attempts. Records are created when an attempt starts, advanced by the
/// orchestrator and never deleted.
#[derive(Debug, Clone)]
pub struct DeploymentHistory {
    storage: Db,

    /// How many records are returned for display purposes.
    retention: u64,
}

impl DeploymentHistory {
    pub fn new(storage: Db, retention: u64) -> Self {
        Self { storage, retention }
    }

    /// Records a new attempt. Fails with `StorageError::Exists` if another attempt is already in progress.
    pub async fn begin(&self, deployment: &Deployment) -> Result<(), HistoryError> {
        let storage_deployment: storage::deployments::Deployment = deployment
            .clone()
            .try_into()
            .map_err(HistoryError::Serialization)?;

        let mut conn = self.storage.write_conn().await?;
        storage::deployments::insert(&mut conn, &storage_deployment).await?;

        Ok(())
    }

    /// Persists the step a running attempt has moved on to along with its backup handle.
    pub async fn advance(&self, deployment: &Deployment) -> Result<(), HistoryError> {
        let mut conn = self.storage.write_conn().await?;

        storage::deployments::update(
            &mut conn,
            &deployment.deployment_id,
            storage::deployments::UpdatableFields {
                current_step: Some(deployment.current_step.to_string()),
                backup_id: deployment.backup_id.clone(),
                ..Default::default()
            },
        )
        .await?;

        Ok(())
    }

    /// Writes the terminal state of an attempt.
    pub async fn finish(&self, deployment: &Deployment) -> Result<(), HistoryError> {
        let error = serde_json::to_string(&deployment.error)
            .map_err(|e| HistoryError::Serialization(e.into()))?;

        let mut conn = self.storage.write_conn().await?;

        storage::deployments::update(
            &mut conn,
            &deployment.deployment_id,
            storage::deployments::UpdatableFields {
                status: Some(deployment.status.to_string()),
                current_step: Some(deployment.current_step.to_string()),
                backup_id: deployment.backup_id.clone(),
                ended: Some(deployment.ended.to_string()),
                error: Some(error),
            },
        )
        .await?;

        Ok(())
    }

    /// Returns the most recent attempts first. The limit is capped at the retention window.
    pub async fn list(&self, limit: Option<u64>) -> Result<Vec<Deployment>, HistoryError> {
        let limit = match limit {
            Some(limit) if limit > 0 && limit < self.retention => limit,
            _ => self.retention,
        };

        let mut conn = self.storage.read_conn().await?;
        let storage_deployments = storage::deployments::list(&mut conn, limit).await?;

        let mut deployments = vec![];

        for storage_deployment in storage_deployments {
            let deployment =
                Deployment::try_from(storage_deployment).map_err(HistoryError::Serialization)?;
            deployments.push(deployment);
        }

        Ok(deployments)
    }

    pub async fn get(&self, deployment_id: &str) -> Result<Deployment, HistoryError> {
        let mut conn = self.storage.read_conn().await?;
        let storage_deployment = storage::deployments::get(&mut conn, deployment_id).await?;

        Deployment::try_from(storage_deployment).map_err(HistoryError::Serialization)
    }

    pub async fn latest(&self) -> Result<Option<Deployment>, HistoryError> {
        let mut conn = self.storage.read_conn().await?;

        let storage_deployment = match storage::deployments::get_latest(&mut conn).await {
            Ok(deployment) => deployment,
            Err(StorageError::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Deployment::try_from(storage_deployment)
            .map(Some)
            .map_err(HistoryError::Serialization)
    }

    pub async fn in_progress(&self) -> Result<Option<Deployment>, HistoryError> {
        let mut conn = self.storage.read_conn().await?;
        let running = storage::deployments::list_in_progress(&mut conn).await?;

        match running.into_iter().next() {
            Some(deployment) => Deployment::try_from(deployment)
                .map(Some)
                .map_err(HistoryError::Serialization),
            None => Ok(None),
        }
    }
}
