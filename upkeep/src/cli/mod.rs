mod check;
mod history;
mod recover;
mod status;
mod update;

use crate::{conf, updater::Updater};
use anyhow::{Context, Result};
use chrono_humanize::{Accuracy, HumanTime, Tense};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::Color;
use std::str::FromStr;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser, Clone)]
#[command(name = "upkeep")]
#[command(bin_name = "upkeep")]
#[command(about = "Upkeep keeps an on-prem installation up to date.")]
#[command(
    long_about = "Upkeep keeps an on-prem installation up to date.\n\nIt checks the update feed for new releases,
    downloads and verifies them and deploys them step by step. Any failure after the backup point is rolled back
    so the installation is always left in a known-good state."
)]
#[command(version)]
pub struct Args {
    /// Set configuration path; if empty default paths are used
    #[arg(long, value_name = "PATH")]
    pub config_path: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Commands {
    /// Check the update feed for a newer release.
    Check {
        /// Ignore any cached result and ask the feed again.
        #[arg(short, long)]
        force: bool,
    },

    /// Check for, download and deploy the latest release.
    Update {
        /// Ignore any cached check result.
        #[arg(short, long)]
        force: bool,
    },

    /// List recent deployment attempts, newest first.
    History {
        /// How many deployments to show; bounded by the configured retention.
        #[arg(short, long)]
        limit: Option<u64>,
    },

    /// Show the current version and deployment state.
    Status,

    /// Close out a deployment left in progress by a process that is no longer running.
    Recover {
        /// Also close out deployments whose owner cannot be checked, such as ones started on another host.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone)]
pub struct Cli {
    conf: conf::Config,
    args: Args,
}

impl Cli {
    pub fn new() -> Result<Self> {
        let args = Args::parse();

        let conf = conf::parse(args.config_path.as_deref())
            .context("Could not parse configuration")?;

        Ok(Cli { conf, args })
    }

    pub async fn run(&mut self) -> Result<()> {
        init_logging(&self.conf.general)?;

        let updater = Updater::new(self.conf.clone())
            .await
            .context("Could not initialize updater")?;

        match self.args.command.clone() {
            Commands::Check { force } => self.check(&updater, force).await,
            Commands::Update { force } => self.update(&updater, force).await,
            Commands::History { limit } => self.history(&updater, limit).await,
            Commands::Status => self.status(&updater).await,
            Commands::Recover { force } => self.recover(&updater, force).await,
        }
    }
}

/// Logs go to stderr so that command output on stdout stays readable.
fn init_logging(general: &conf::General) -> Result<()> {
    let level = LevelFilter::from_str(&general.log_level).with_context(|| {
        format!(
            "Could not parse log_level '{}'; must be one of ['trace', 'debug', 'info', 'warn', 'error', 'off']",
            general.log_level
        )
    })?;

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);

    let result = match general.log_format {
        conf::LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        conf::LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };

    result.context("Could not initialize logging")
}

/// Return the current epoch time in milliseconds.
fn epoch_milli() -> u64 {
    crate::updater::epoch_milli()
}

/// Transforms the given time into a humanized duration string from the current time.
/// or if time is not valid returns None.
/// (i.e. 'about an hour ago' )
fn humanize_relative_duration(time: u64) -> Option<String> {
    if time == 0 {
        return None;
    }

    let time_diff = epoch_milli().saturating_sub(time);
    let time_diff_duration = chrono::Duration::milliseconds(-(time_diff as i64));
    Some(HumanTime::from(time_diff_duration).to_string())
}

/// Transforms the given two time intervals into a humanized duration string.
/// Subtracts time two(end time) from time one(start time).
fn humanize_absolute_duration(time_one: u64, time_two: u64) -> String {
    let mut time_two = time_two;

    // If time_two is just zero the thing we're trying to calculate
    // the duration of probably isn't finished. So we'll sub in a current
    // running time by entering current epoch.
    if time_two == 0 {
        time_two = epoch_milli()
    }

    if time_two < time_one {
        return "0s".to_string();
    }

    let time_diff = time_two - time_one;
    let time_diff_duration = chrono::Duration::milliseconds(time_diff as i64);
    HumanTime::from(time_diff_duration).to_text_en(Accuracy::Precise, Tense::Present)
}

fn colorize_status_text(status: &str) -> String {
    match status {
        "succeeded" => status.green().to_string(),
        "in_progress" => status.yellow().to_string(),
        "rolled_back" => status.magenta().to_string(),
        "failed" => status.red().to_string(),
        _ => status.to_string(),
    }
}

fn colorize_status_text_comfy(status: &str) -> Color {
    match status {
        "succeeded" => Color::Green,
        "in_progress" => Color::Yellow,
        "rolled_back" => Color::Magenta,
        "failed" => Color::Red,
        _ => Color::Reset,
    }
}
