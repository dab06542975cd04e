use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use rust_embed::RustEmbed;
use serde::Deserialize;
use std::borrow::Cow;
use std::path::PathBuf;
use std::time::Duration;
use strum::{Display, EnumString};

/// Searched when the user does not pass a configuration path.
const DEFAULT_CONFIG_PATH: &str = "/etc/upkeep/upkeep.toml";

/// Prefix for environment variables; nested keys are separated by a double underscore.
/// (i.e. UPKEEP_FEED__URL sets `feed.url`)
const ENV_PREFIX: &str = "UPKEEP_";

#[derive(RustEmbed)]
#[folder = "src/conf/"]
struct EmbeddedConfigFS;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub general: General,
    pub storage: Storage,
    pub paths: Paths,
    pub feed: Feed,
    pub download: Download,
    pub deployment: Deployment,
    pub backup: Backup,
    pub maintenance: Maintenance,
    pub health: Health,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct General {
    pub log_level: String,
    pub log_format: LogFormat,

    /// Seeds the recorded current version on first start; afterwards the database is the source of truth.
    pub app_version: String,

    pub runtime_version: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Storage {
    pub database_path: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// The live installation tree that updates are applied to.
    pub install_root: String,

    /// Holds downloaded archives, staging directories and backups.
    pub storage_root: String,

    pub public_root: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    /// Update feed endpoint. Left empty, update checks report "not configured".
    pub url: String,
    pub app_key: String,
    pub check_timeout: u64, // in seconds
    pub cache_ttl: u64,     // in seconds
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub timeout: u64, // in seconds
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub min_free_disk_mb: u64,

    /// How many times the backup step is attempted before the deployment is failed.
    pub backup_attempts: u32,

    pub step_timeout: u64, // in seconds
    pub history_retention: u64,

    /// Files, relative to the install root, that must exist after an update is applied.
    pub critical_files: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    /// Run from the install root; its stdout becomes the database dump stored with each backup.
    pub database_dump_command: String,

    /// Run from the install root with the stored dump on stdin when a backup is restored.
    pub database_restore_command: String,
}

impl Backup {
    pub fn backs_up_database(&self) -> bool {
        !self.database_dump_command.trim().is_empty()
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Maintenance {
    /// Run in order from the install root; the first failing command stops the sequence.
    pub commands: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Health {
    pub url: String,
    pub timeout: u64, // in seconds
}

impl Feed {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }
}

impl Download {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Health {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Paths {
    pub fn install_root(&self) -> PathBuf {
        PathBuf::from(&self.install_root)
    }

    pub fn storage_root(&self) -> PathBuf {
        PathBuf::from(&self.storage_root)
    }

    pub fn public_root(&self) -> PathBuf {
        PathBuf::from(&self.public_root)
    }

    /// Downloaded archives and staging directories live here.
    pub fn updates_dir(&self) -> PathBuf {
        self.storage_root().join("updates")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.storage_root().join("backups")
    }
}

impl Deployment {
    pub fn min_free_disk_bytes(&self) -> u64 {
        self.min_free_disk_mb * 1024 * 1024
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout)
    }
}

/// returns an embedded default configuration file in bytes.
fn default_config() -> Cow<'static, [u8]> {
    let config_file = EmbeddedConfigFS::get("default_config.toml")
        .expect("default configuration file is embedded at build time");
    config_file.data
}

/// Assembles the configuration sources in order of priority; later sources override earlier ones.
///
/// embedded defaults < configuration file < environment variables
fn sources(path_override: Option<&str>) -> Result<Figment, figment::Error> {
    let default_config_raw = default_config();
    let default_config = std::str::from_utf8(&default_config_raw)
        .map_err(|e| figment::Error::from(format!("embedded config is not valid utf-8; {e}")))?;

    let path = path_override.unwrap_or(DEFAULT_CONFIG_PATH);

    Ok(Figment::new()
        .merge(Toml::string(default_config))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__")))
}

/// returns a correctly deserialized config struct from the embedded defaults, the configuration file and the
/// environment.
pub fn parse(path_override: Option<&str>) -> Result<Config, figment::Error> {
    sources(path_override)?.extract()
}

/// The embedded defaults alone, without reading files or the environment.
#[cfg(test)]
pub fn embedded() -> Config {
    let default_config_raw = default_config();
    let default_config = std::str::from_utf8(&default_config_raw).unwrap();

    Figment::new()
        .merge(Toml::string(default_config))
        .extract()
        .unwrap()
}
