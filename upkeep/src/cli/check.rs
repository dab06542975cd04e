use crate::{cli::Cli, updater::Updater};
use anyhow::{Context, Result};
use colored::Colorize;
use polyfmt::{println, success, Spinner};

impl Cli {
    pub async fn check(&self, updater: &Updater, force: bool) -> Result<()> {
        let spinner = Spinner::create("Checking for updates");

        let info = updater
            .check(force)
            .await
            .context("Could not check for updates")?;

        drop(spinner);

        if !info.available {
            println!(
                "No update available for {}: {}",
                format!("v{}", info.current_version).magenta(),
                info.reason.as_deref().unwrap_or("unknown reason")
            );
            return Ok(());
        }

        let latest = info.latest_version.clone().unwrap_or_default();

        success!(
            "Update available: {} -> {}",
            format!("v{}", info.current_version).magenta(),
            format!("v{latest}").green()
        );

        if info.is_security_update {
            println!("  {}", "This is a security update.".red());
        }

        if !info.release_date.is_empty() {
            println!("  Released: {}", info.release_date);
        }

        if let Some(size) = info.file_size {
            println!("  Size: {:.1} MB", size as f64 / (1024.0 * 1024.0));
        }

        if !info.changelog.is_empty() {
            println!("  Changes:");
            for change in &info.changelog {
                println!("    - {}", change);
            }
        }

        if !info.patch_notes.is_empty() {
            println!("  Notes: {}", info.patch_notes);
        }

        println!("  Install it with: {}", "upkeep update".cyan());

        Ok(())
    }
}
