use crate::{storage, updater::epoch_milli};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Created but not yet started.
    #[default]
    Pending,

    InProgress,

    Succeeded,

    /// Either nothing was changed yet, or a rollback was attempted and did not succeed.
    Failed,

    /// A destructive step failed and the previous state was restored.
    RolledBack,
}

/// The fixed, strictly ordered steps of a deployment.
#[derive(
    Debug,
    Clone,
    Copy,
    Display,
    Default,
    PartialEq,
    EnumString,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    #[default]
    Precheck,
    Backup,
    Extract,
    Apply,
    PostDeploy,
    Verify,
    Done,
}

impl Step {
    pub const ORDER: [Step; 7] = [
        Step::Precheck,
        Step::Backup,
        Step::Extract,
        Step::Apply,
        Step::PostDeploy,
        Step::Verify,
        Step::Done,
    ];

    /// Returns the step that follows this one or None for the final step.
    pub fn next(&self) -> Option<Step> {
        let position = Step::ORDER.iter().position(|step| step == self)?;
        Step::ORDER.get(position + 1).copied()
    }

    /// Steps that run after the backup point and can leave the live installation modified.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Step::Extract | Step::Apply | Step::PostDeploy | Step::Verify | Step::Done
        )
    }
}

/// Describes why a deployment did not succeed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentError {
    /// The step that failed.
    pub step: Step,

    pub message: String,

    /// Every individual condition that failed, for steps that check more than one thing.
    #[serde(default)]
    pub details: Vec<String>,

    /// Set when the restore after a destructive failure also failed. The installation may be partially updated
    /// and needs an operator.
    #[serde(default)]
    pub rollback_failed: bool,

    #[serde(default)]
    pub rollback_error: Option<String>,
}

/// One attempt at applying an update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    /// Unique identifier for the deployment.
    pub deployment_id: String,

    /// Version that was current when the deployment started.
    pub start_version: String,

    /// Version being deployed.
    pub target_version: String,

    pub status: Status,

    pub current_step: Step,

    /// Only set once the backup step succeeded.
    pub backup_id: Option<String>,

    /// The process running the deployment, as written by `lock::Owner`.
    pub owner: String,

    /// Time of deployment start in epoch milliseconds.
    pub started: u64,

    /// Time of deployment end in epoch milliseconds.
    pub ended: u64,

    pub error: Option<DeploymentError>,
}

impl Deployment {
    pub fn new(start_version: &str, target_version: &str) -> Self {
        Deployment {
            deployment_id: Uuid::now_v7().to_string(),
            start_version: start_version.into(),
            target_version: target_version.into(),
            status: Status::Pending,
            current_step: Step::Precheck,
            backup_id: None,
            owner: String::new(),
            started: epoch_milli(),
            ended: 0,
            error: None,
        }
    }

    /// Milliseconds between start and end, or zero while the deployment is still running.
    pub fn duration_ms(&self) -> u64 {
        if self.ended == 0 {
            return 0;
        }

        self.ended.saturating_sub(self.started)
    }

    pub fn rollback_failed(&self) -> bool {
        self.error.as_ref().is_some_and(|err| err.rollback_failed)
    }
}

impl TryFrom<storage::deployments::Deployment> for Deployment {
    type Error = anyhow::Error;

    fn try_from(value: storage::deployments::Deployment) -> Result<Self> {
        let started = value.started.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'started' from storage value '{}'",
                value.started
            )
        })?;

        let ended = value.ended.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'ended' from storage value '{}'",
                value.ended
            )
        })?;

        let status = Status::from_str(&value.status).with_context(|| {
            format!(
                "Could not parse field 'status' from storage value '{}'",
                value.status
            )
        })?;

        let current_step = Step::from_str(&value.current_step).with_context(|| {
            format!(
                "Could not parse field 'current_step' from storage value '{}'",
                value.current_step
            )
        })?;

        let error = serde_json::from_str(&value.error).with_context(|| {
            format!(
                "Could not parse field 'error' from storage value '{}'",
                value.error
            )
        })?;

        Ok(Deployment {
            deployment_id: value.deployment_id,
            start_version: value.start_version,
            target_version: value.target_version,
            status,
            current_step,
            backup_id: value.backup_id,
            owner: value.owner,
            started,
            ended,
            error,
        })
    }
}

impl TryFrom<Deployment> for storage::deployments::Deployment {
    type Error = anyhow::Error;

    fn try_from(value: Deployment) -> Result<Self> {
        let error = serde_json::to_string(&value.error).with_context(|| {
            format!(
                "Could not parse field 'error' into storage value '{:#?}'",
                value.error
            )
        })?;

        Ok(Self {
            deployment_id: value.deployment_id,
            start_version: value.start_version,
            target_version: value.target_version,
            status: value.status.to_string(),
            current_step: value.current_step.to_string(),
            backup_id: value.backup_id,
            owner: value.owner,
            started: value.started.to_string(),
            ended: value.ended.to_string(),
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(Step::Precheck, Some(Step::Backup))]
    #[case(Step::Backup, Some(Step::Extract))]
    #[case(Step::Extract, Some(Step::Apply))]
    #[case(Step::Apply, Some(Step::PostDeploy))]
    #[case(Step::PostDeploy, Some(Step::Verify))]
    #[case(Step::Verify, Some(Step::Done))]
    #[case(Step::Done, None)]
    fn steps_advance_in_fixed_order(#[case] step: Step, #[case] expected: Option<Step>) {
        assert_eq!(step.next(), expected);
    }

    #[test]
    fn step_names_match_storage_format() {
        assert_eq!(Step::PostDeploy.to_string(), "post_deploy");
        assert_eq!(Status::RolledBack.to_string(), "rolled_back");
        assert_eq!(Step::from_str("post_deploy").unwrap(), Step::PostDeploy);
        assert_eq!(Status::from_str("in_progress").unwrap(), Status::InProgress);
    }

    #[test]
    fn storage_conversion_keeps_error_payload() {
        let mut deployment = Deployment::new("1.0.0", "1.1.0");
        deployment.status = Status::Failed;
        deployment.current_step = Step::Apply;
        deployment.backup_id = Some("B1".into());
        deployment.owner = "payroll-01/boot/100".into();
        deployment.ended = deployment.started + 1500;
        deployment.error = Some(DeploymentError {
            step: Step::Apply,
            message: "could not copy file".into(),
            details: vec![],
            rollback_failed: true,
            rollback_error: Some("restore refused".into()),
        });

        let stored: storage::deployments::Deployment = deployment.clone().try_into().unwrap();
        assert_eq!(stored.status, "failed");
        assert_eq!(stored.current_step, "apply");

        let restored = Deployment::try_from(stored).unwrap();
        assert_eq!(restored, deployment);
        assert!(restored.rollback_failed());
        assert_eq!(restored.duration_ms(), 1500);
    }

    #[test]
    fn unknown_status_fails_conversion() {
        let stored = storage::deployments::Deployment {
            deployment_id: "x".into(),
            status: "exploded".into(),
            current_step: "apply".into(),
            started: "1".into(),
            ended: "0".into(),
            error: "null".into(),
            ..Default::default()
        };

        assert!(Deployment::try_from(stored).is_err());
    }
}
