use crate::{cli::Cli, updater::Updater};
use anyhow::{Context, Result};
use colored::Colorize;
use polyfmt::{println, success};

impl Cli {
    pub async fn recover(&self, updater: &Updater, force: bool) -> Result<()> {
        let closed = updater
            .recover(force)
            .await
            .context("Could not recover interrupted deployment")?;

        let Some(deployment) = closed else {
            println!("No deployment in progress; nothing to recover");
            return Ok(());
        };

        success!(
            "Closed interrupted deployment {} (v{} -> v{})",
            deployment.deployment_id.green(),
            deployment.start_version,
            deployment.target_version
        );

        if let Some(err) = &deployment.error {
            println!("  Interrupted at: {}", err.step);

            for detail in &err.details {
                println!("    - {}", detail);
            }
        }

        println!(
            "  {}",
            "The installation may be partially updated; verify it before deploying again.".yellow()
        );

        Ok(())
    }
}
