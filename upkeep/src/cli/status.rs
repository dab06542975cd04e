use crate::{
    cli::{colorize_status_text, humanize_relative_duration, Cli},
    updater::Updater,
};
use anyhow::{Context, Result};
use colored::Colorize;
use polyfmt::println;

impl Cli {
    pub async fn status(&self, updater: &Updater) -> Result<()> {
        let status = updater
            .status()
            .await
            .context("Could not retrieve system status")?;

        println!(
            "Current version: {}",
            format!("v{}", status.current_version).magenta()
        );

        println!(
            "Last update check: {}",
            status
                .last_checked
                .and_then(humanize_relative_duration)
                .unwrap_or("Never".into())
        );

        if let Some(info) = &status.last_check {
            if info.available {
                println!(
                    "Update available: {}",
                    format!("v{}", info.latest_version.clone().unwrap_or_default()).green()
                );
            }
        }

        if status.deployment_running {
            println!("Deployment: {}", "in progress".yellow());
        }

        match &status.last_deployment {
            Some(deployment) => {
                println!(
                    "Last deployment: {} v{} -> v{} {}",
                    colorize_status_text(&deployment.status.to_string()),
                    deployment.start_version,
                    deployment.target_version,
                    humanize_relative_duration(deployment.started).unwrap_or_default()
                );

                if let Some(err) = &deployment.error {
                    println!("  Failed at {}: {}", err.step, err.message);

                    if err.rollback_failed {
                        println!(
                            "  {}",
                            "Rollback failed; manual intervention required.".red().bold()
                        );
                    }
                }
            }
            None => println!("Last deployment: None"),
        }

        Ok(())
    }
}
