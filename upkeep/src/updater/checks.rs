use crate::updater::{
    health::HealthProbe, state_machine::StepFailure, state_machine::StepResult,
    system::SystemProbe, versions,
};
use std::{path::PathBuf, sync::Arc};

const MEGABYTE: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CheckSettings {
    /// Version of the runtime the application runs on.
    pub runtime_version: String,

    pub min_free_disk_bytes: u64,
    pub install_root: PathBuf,
    pub storage_root: PathBuf,
    pub public_root: PathBuf,

    /// Paths relative to the install root that a working installation always has.
    pub critical_files: Vec<String>,
}

/// The non-destructive validations run before and after the destructive steps. Every condition is checked so
/// that all problems are reported together.
#[derive(Debug, Clone)]
pub struct Checks {
    settings: CheckSettings,
    system: Arc<dyn SystemProbe>,
    health: Arc<dyn HealthProbe>,
}

impl Checks {
    pub fn new(
        settings: CheckSettings,
        system: Arc<dyn SystemProbe>,
        health: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            settings,
            system,
            health,
        }
    }

    pub async fn precheck(&self, minimum_runtime_version: &str) -> StepResult {
        let mut violations = vec![];

        match versions::satisfies_minimum(&self.settings.runtime_version, minimum_runtime_version) {
            Some(true) => {}
            Some(false) => violations.push(format!(
                "runtime version {} is below required minimum {}",
                self.settings.runtime_version, minimum_runtime_version
            )),
            None => violations.push(format!(
                "could not compare runtime version '{}' to required minimum '{}'",
                self.settings.runtime_version, minimum_runtime_version
            )),
        }

        // Archives, staging directories and backups land under the storage root, which may be its own mount.
        // Roots reporting the same free space are treated as one filesystem.
        let mut shortfalls: Vec<(u64, Vec<String>)> = vec![];

        for root in [&self.settings.install_root, &self.settings.storage_root] {
            match self.system.free_space(root) {
                Ok(free) if free < self.settings.min_free_disk_bytes => {
                    match shortfalls.iter_mut().find(|(bytes, _)| *bytes == free) {
                        Some((_, roots)) => roots.push(root.display().to_string()),
                        None => shortfalls.push((free, vec![root.display().to_string()])),
                    }
                }
                Ok(_) => {}
                Err(e) => violations.push(format!(
                    "could not determine free disk space on {}; {e}",
                    root.display()
                )),
            }
        }

        for (free, roots) in shortfalls {
            violations.push(format!(
                "insufficient disk space: {} MB free on {}, {} MB required",
                free / MEGABYTE,
                roots.join(", "),
                self.settings.min_free_disk_bytes / MEGABYTE
            ));
        }

        for dir in [
            &self.settings.install_root,
            &self.settings.storage_root,
            &self.settings.public_root,
        ] {
            if !self.system.is_writable(dir) {
                violations.push(format!("directory not writable: {}", dir.display()));
            }
        }

        match self.health.status().await {
            Ok(status) if status.database_connected() => {}
            Ok(status) => violations.push(format!(
                "database not connected; health reported '{}'",
                status.database
            )),
            Err(e) => violations.push(format!("database connectivity check failed; {e}")),
        }

        into_result("precheck failed", violations)
    }

    pub async fn verify(&self, target_version: &str) -> StepResult {
        let mut violations = vec![];

        match self.health.status().await {
            Ok(status) => {
                if !same_version(&status.version, target_version) {
                    violations.push(format!(
                        "running version {} does not match target version {}",
                        status.version, target_version
                    ));
                }

                if !status.database_connected() {
                    violations.push(format!(
                        "database not connected; health reported '{}'",
                        status.database
                    ));
                }
            }
            Err(e) => violations.push(format!("health check failed; {e}")),
        }

        for file in &self.settings.critical_files {
            if !self.settings.install_root.join(file).exists() {
                violations.push(format!("critical file missing: {file}"));
            }
        }

        into_result("verification failed", violations)
    }
}

fn same_version(running: &str, target: &str) -> bool {
    match (versions::parse_lenient(running), versions::parse_lenient(target)) {
        (Some(running), Some(target)) => running == target,
        _ => running.trim() == target.trim(),
    }
}

fn into_result(summary: &str, violations: Vec<String>) -> StepResult {
    if violations.is_empty() {
        return Ok(());
    }

    Err(StepFailure::with_details(
        format!("{summary}: {}", violations.join("; ")),
        violations,
    ))
}
