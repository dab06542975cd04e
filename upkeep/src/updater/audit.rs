use crate::updater::deployments::Deployment;
use std::fmt::Debug;
use tracing::{error, info};

/// Receives one event per deployment that reached a terminal state.
pub trait AuditSink: Debug + Send + Sync + 'static {
    fn record(&self, deployment: &Deployment);
}

/// Emits audit events through tracing under the "audit" target so they can be routed separately.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, deployment: &Deployment) {
        let backup_id = deployment.backup_id.as_deref().unwrap_or("");

        let Some(err) = &deployment.error else {
            info!(
                target: "audit",
                deployment_id = %deployment.deployment_id,
                version = %deployment.target_version,
                duration_ms = deployment.duration_ms(),
                backup_id = %backup_id,
                status = %deployment.status,
                "Deployment finished"
            );
            return;
        };

        error!(
            target: "audit",
            deployment_id = %deployment.deployment_id,
            version = %deployment.target_version,
            duration_ms = deployment.duration_ms(),
            backup_id = %backup_id,
            status = %deployment.status,
            step = %err.step,
            error = %err.message,
            details = ?err.details,
            rollback_failed = err.rollback_failed,
            rollback_error = ?err.rollback_error,
            "Deployment did not succeed"
        );
    }
}
