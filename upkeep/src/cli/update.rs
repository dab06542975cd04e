use crate::{
    cli::{colorize_status_text, humanize_absolute_duration, Cli},
    updater::{deployments::Status, UpdateOutcome, Updater},
};
use anyhow::{bail, Context, Result};
use colored::Colorize;
use polyfmt::{error, println, success, Spinner};
use tokio_util::sync::CancellationToken;
use tracing::warn;

impl Cli {
    pub async fn update(&self, updater: &Updater, force: bool) -> Result<()> {
        // Interrupting only has an effect until the backup is taken; after that the deployment runs to the end.
        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; deployment stops if it has not reached the backup step yet");
                signal_cancel.cancel();
            }
        });

        let spinner = Spinner::create("Updating");

        let outcome = updater
            .update(force, cancel)
            .await
            .context("Could not run update")?;

        drop(spinner);

        let deployment = match outcome {
            UpdateOutcome::NoUpdate(info) => {
                println!(
                    "Nothing to do for {}: {}",
                    format!("v{}", info.current_version).magenta(),
                    info.reason.as_deref().unwrap_or("no update available")
                );
                return Ok(());
            }
            UpdateOutcome::DownloadFailed { info, error } => {
                bail!(
                    "Could not download update v{}; {}",
                    info.latest_version.unwrap_or_default(),
                    error
                );
            }
            UpdateOutcome::Deployed(deployment) => deployment,
        };

        let versions = format!(
            "v{} -> v{}",
            deployment.start_version, deployment.target_version
        );
        let took = humanize_absolute_duration(deployment.started, deployment.ended);

        if deployment.status == Status::Succeeded {
            success!("Deployed {} in {}", versions.green(), took);
            return Ok(());
        }

        error!(
            "Deployment {} {} ({})",
            versions,
            colorize_status_text(&deployment.status.to_string()),
            deployment.deployment_id
        );

        if let Some(err) = &deployment.error {
            println!("  Step: {}", err.step);
            println!("  Reason: {}", err.message);

            for detail in &err.details {
                println!("    - {}", detail);
            }

            if err.rollback_failed {
                println!(
                    "  {}",
                    "Rollback failed; the installation may be partially updated and needs manual attention."
                        .red()
                        .bold()
                );

                if let Some(rollback_error) = &err.rollback_error {
                    println!("  Rollback error: {}", rollback_error);
                }
            }
        }

        bail!("Deployment did not succeed")
    }
}
