use crate::{
    cli::{colorize_status_text_comfy, humanize_absolute_duration, humanize_relative_duration, Cli},
    updater::Updater,
};
use anyhow::{Context, Result};
use comfy_table::{Cell, CellAlignment, Color, ContentArrangement};
use polyfmt::println;

impl Cli {
    pub async fn history(&self, updater: &Updater, limit: Option<u64>) -> Result<()> {
        let deployments = updater
            .history(limit)
            .await
            .context("Could not retrieve deployment history")?;

        if deployments.is_empty() {
            println!("No deployments recorded yet");
            return Ok(());
        }

        let mut table = comfy_table::Table::new();
        table
            .load_preset(comfy_table::presets::ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("id")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("versions")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("started")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("duration")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("status")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("failed step")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
            ]);

        for deployment in deployments {
            let status = deployment.status.to_string();

            let failed_step = match &deployment.error {
                Some(err) if err.rollback_failed => format!("{} (rollback failed)", err.step),
                Some(err) => err.step.to_string(),
                None => String::new(),
            };

            table.add_row(vec![
                Cell::new(&deployment.deployment_id).fg(Color::Green),
                Cell::new(format!(
                    "{} -> {}",
                    deployment.start_version, deployment.target_version
                )),
                Cell::new(humanize_relative_duration(deployment.started).unwrap_or("Never".into())),
                Cell::new(humanize_absolute_duration(deployment.started, deployment.ended)),
                Cell::new(&status).fg(colorize_status_text_comfy(&status)),
                Cell::new(failed_step),
            ]);
        }

        println!("{}", &table.to_string());
        Ok(())
    }
}
