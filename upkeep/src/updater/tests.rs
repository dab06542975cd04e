use super::*;
use crate::{
    storage::tests::TestHarness,
    updater::{
        archive::tests::build_archive,
        artifacts::Artifact,
        backup::BackupError,
        checks::tests::{FakeHealth, FakeSystem},
        deployments::Step,
        lock::{tests::exited_pid, Owner},
        maintenance::{MaintenanceError, MaintenanceReport, TaskResult},
        orchestrator::INTERRUPTED_MESSAGE,
    },
};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};
use tempfile::TempDir;

const GIGABYTE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Default)]
struct FakeBackups {
    /// How many create calls fail before one succeeds.
    failing_creates: usize,
    restore_fails: bool,
    creates: AtomicUsize,
    restores: Mutex<Vec<String>>,
}

#[async_trait]
impl BackupService for FakeBackups {
    async fn create_backup(&self, _cancel: &CancellationToken) -> Result<String, BackupError> {
        let call = self.creates.fetch_add(1, Ordering::SeqCst);

        if call < self.failing_creates {
            return Err(BackupError::Task("disk busy".into()));
        }

        Ok("B1".into())
    }

    async fn restore(&self, backup_id: &str) -> Result<(), BackupError> {
        self.restores.lock().unwrap().push(backup_id.into());

        if self.restore_fails {
            return Err(BackupError::NotFound(backup_id.into()));
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
struct FakeMaintenance {
    fail: bool,
    delay: Option<Duration>,
    runs: AtomicUsize,
}

#[async_trait]
impl MaintenanceRunner for FakeMaintenance {
    async fn run(&self, cancel: &CancellationToken) -> Result<MaintenanceReport, MaintenanceError> {
        self.runs.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(MaintenanceError::Cancelled("php artisan migrate --force".into()));
                }
            }
        }

        Ok(MaintenanceReport {
            tasks: vec![TaskResult {
                task: "php artisan migrate --force".into(),
                success: !self.fail,
                exit_code: Some(if self.fail { 1 } else { 0 }),
                output: if self.fail {
                    "SQLSTATE[42S01]: table already exists".into()
                } else {
                    String::new()
                },
            }],
        })
    }
}

#[derive(Debug, Default)]
struct RecordingAudit {
    records: Mutex<Vec<Deployment>>,
}

impl AuditSink for RecordingAudit {
    fn record(&self, deployment: &Deployment) {
        self.records.lock().unwrap().push(deployment.clone());
    }
}

struct Fakes {
    backups: FakeBackups,
    maintenance: FakeMaintenance,
    health: FakeHealth,
    system: FakeSystem,
}

impl Default for Fakes {
    fn default() -> Self {
        Self {
            backups: FakeBackups::default(),
            maintenance: FakeMaintenance::default(),
            // Precheck sees the old version, verify sees the new one.
            health: FakeHealth::switching("1.0.0", "1.1.0"),
            system: FakeSystem {
                free_bytes: 10 * GIGABYTE,
                unwritable: vec![],
            },
        }
    }
}

struct Harness {
    db: TestHarness,
    _dir: TempDir,
    conf: conf::Config,
    updater: Updater,
    backups: Arc<FakeBackups>,
    maintenance: Arc<FakeMaintenance>,
    audit: Arc<RecordingAudit>,
}

impl Harness {
    async fn new(fakes: Fakes) -> Self {
        Self::with_feed(fakes, "").await
    }

    async fn with_feed(fakes: Fakes, feed_url: &str) -> Self {
        let db = TestHarness::new().await;
        let dir = tempfile::tempdir().unwrap();

        let install_root = dir.path().join("app");
        std::fs::create_dir_all(install_root.join("public")).unwrap();
        std::fs::create_dir_all(install_root.join("storage")).unwrap();
        std::fs::write(install_root.join("artisan"), "#!/usr/bin/env php").unwrap();

        let mut conf = conf::embedded();
        conf.general.app_version = "1.0.0".into();
        conf.general.runtime_version = "8.2.0".into();
        conf.paths.install_root = install_root.to_string_lossy().to_string();
        conf.paths.storage_root = install_root.join("storage").to_string_lossy().to_string();
        conf.paths.public_root = install_root.join("public").to_string_lossy().to_string();
        conf.feed.url = feed_url.into();
        conf.deployment.critical_files = vec!["artisan".into()];
        conf.deployment.step_timeout = 1;

        let backups = Arc::new(fakes.backups);
        let maintenance = Arc::new(fakes.maintenance);
        let audit = Arc::new(RecordingAudit::default());

        let updater = Updater::with_collaborators(
            conf.clone(),
            db.db.clone(),
            Collaborators {
                cache: Arc::new(MemoryCache::new()),
                backups: backups.clone(),
                maintenance: maintenance.clone(),
                health: Arc::new(fakes.health),
                system: Arc::new(fakes.system),
                audit: audit.clone(),
            },
        )
        .await
        .unwrap();

        Self {
            db,
            _dir: dir,
            conf,
            updater,
            backups,
            maintenance,
            audit,
        }
    }

    fn install_root(&self) -> PathBuf {
        self.conf.paths.install_root()
    }

    fn updates_dir(&self) -> PathBuf {
        self.conf.paths.updates_dir()
    }

    /// A verified artifact holding the given files, as the downloader would hand it over.
    fn artifact(&self, files: &[(&str, &str)]) -> Artifact {
        std::fs::create_dir_all(self.updates_dir()).unwrap();
        let path = self
            .updates_dir()
            .join(format!("update-1.1.0-{}.tar.gz", uuid::Uuid::now_v7()));
        build_archive(&path, files);

        Artifact {
            local_path: path,
            declared_checksum: "ignored".into(),
            computed_checksum: Some("ignored".into()),
            verified: true,
        }
    }

    fn request(&self, files: &[(&str, &str)]) -> DeploymentRequest {
        DeploymentRequest {
            target_version: "1.1.0".into(),
            minimum_runtime_version: "8.1".into(),
            artifact: self.artifact(files),
        }
    }

    async fn deploy(&self, files: &[(&str, &str)]) -> Deployment {
        self.updater
            .deploy(self.request(files), CancellationToken::new())
            .await
            .unwrap()
    }

    fn leftover_update_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.updates_dir()) {
            Ok(entries) => entries.map(|entry| entry.unwrap().path()).collect(),
            Err(_) => vec![],
        }
    }
}

const RELEASE: &[(&str, &str)] = &[
    ("artisan", "#!/usr/bin/env php # 1.1.0"),
    ("app/Payroll/Calculator.php", "<?php // 1.1.0"),
];

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn successful_deployment_updates_version_and_cleans_up() {
    let harness = Harness::new(Fakes::default()).await;

    let deployment = harness.deploy(RELEASE).await;

    assert_eq!(deployment.status, Status::Succeeded);
    assert_eq!(deployment.current_step, Step::Done);
    assert_eq!(deployment.start_version, "1.0.0");
    assert_eq!(deployment.backup_id, Some("B1".to_string()));
    assert_eq!(deployment.error, None);
    assert!(deployment.ended >= deployment.started);

    assert_eq!(harness.updater.current_version().await.unwrap(), "1.1.0");
    assert_eq!(
        read(&harness.install_root().join("app/Payroll/Calculator.php")),
        "<?php // 1.1.0"
    );

    // Neither the staging directory nor the archive survive.
    assert!(harness.leftover_update_files().is_empty());

    assert_eq!(harness.maintenance.runs.load(Ordering::SeqCst), 1);
    assert!(harness.backups.restores.lock().unwrap().is_empty());

    let audited = harness.audit.records.lock().unwrap().clone();
    assert_eq!(audited, vec![deployment.clone()]);

    let stored = harness.updater.history(None).await.unwrap();
    assert_eq!(stored, vec![deployment]);
}

#[tokio::test]
async fn precheck_reports_all_violations_without_backup() {
    let harness = Harness::new(Fakes {
        system: FakeSystem {
            free_bytes: 100 * 1024 * 1024,
            unwritable: vec![PathBuf::from("storage")],
        },
        ..Default::default()
    })
    .await;

    let deployment = harness.deploy(RELEASE).await;

    assert_eq!(deployment.status, Status::Failed);
    assert_eq!(deployment.backup_id, None);

    let err = deployment.error.unwrap();
    assert_eq!(err.step, Step::Precheck);
    assert!(!err.rollback_failed);
    assert_eq!(err.details.len(), 2);
    assert!(err.details[0].starts_with("insufficient disk space"));
    assert!(err.details[1].starts_with("directory not writable"));

    assert_eq!(harness.backups.creates.load(Ordering::SeqCst), 0);
    assert_eq!(harness.maintenance.runs.load(Ordering::SeqCst), 0);
    assert_eq!(read(&harness.install_root().join("artisan")), "#!/usr/bin/env php");
    assert!(harness.leftover_update_files().is_empty());
}

#[tokio::test]
async fn apply_failure_rolls_back_to_backup() {
    let harness = Harness::new(Fakes::default()).await;

    // A plain file where the release needs a directory makes the copy fail partway.
    std::fs::write(harness.install_root().join("config"), "not a directory").unwrap();

    let deployment = harness
        .deploy(&[
            ("app/Payroll/Calculator.php", "<?php // 1.1.0"),
            ("config/app.php", "<?php return [];"),
        ])
        .await;

    assert_eq!(deployment.status, Status::RolledBack);
    assert_eq!(deployment.backup_id, Some("B1".to_string()));

    let err = deployment.error.clone().unwrap();
    assert_eq!(err.step, Step::Apply);
    assert!(!err.rollback_failed);
    assert!(err.message.starts_with("could not apply update files"));

    assert_eq!(*harness.backups.restores.lock().unwrap(), vec!["B1".to_string()]);
    assert_eq!(harness.maintenance.runs.load(Ordering::SeqCst), 0);
    assert_eq!(harness.updater.current_version().await.unwrap(), "1.0.0");
    assert!(harness.leftover_update_files().is_empty());

    let stored = harness.updater.history(None).await.unwrap();
    assert_eq!(stored, vec![deployment]);
}

#[tokio::test]
async fn verify_version_mismatch_never_succeeds() {
    let harness = Harness::new(Fakes {
        health: FakeHealth::fixed("1.0.0", "ok"),
        ..Default::default()
    })
    .await;

    let deployment = harness.deploy(RELEASE).await;

    assert_eq!(deployment.status, Status::RolledBack);

    let err = deployment.error.unwrap();
    assert_eq!(err.step, Step::Verify);
    assert_eq!(
        err.details,
        vec!["running version 1.0.0 does not match target version 1.1.0".to_string()]
    );

    assert_eq!(harness.backups.restores.lock().unwrap().len(), 1);
    assert_eq!(harness.updater.current_version().await.unwrap(), "1.0.0");
}

#[tokio::test]
async fn failed_rollback_is_flagged() {
    let harness = Harness::new(Fakes {
        backups: FakeBackups {
            restore_fails: true,
            ..Default::default()
        },
        maintenance: FakeMaintenance {
            fail: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;

    let deployment = harness.deploy(RELEASE).await;

    assert_eq!(deployment.status, Status::Failed);
    assert!(deployment.rollback_failed());

    let err = deployment.error.clone().unwrap();
    assert_eq!(err.step, Step::PostDeploy);
    assert_eq!(
        err.message,
        "maintenance task 'php artisan migrate --force' failed with exit code 1"
    );
    assert_eq!(
        err.details,
        vec!["SQLSTATE[42S01]: table already exists".to_string()]
    );
    assert!(err.rollback_error.unwrap().contains("B1"));

    // Exactly one restore attempt.
    assert_eq!(harness.backups.restores.lock().unwrap().len(), 1);

    let audited = harness.audit.records.lock().unwrap().clone();
    assert_eq!(audited.len(), 1);
    assert!(audited[0].rollback_failed());
}

#[tokio::test]
async fn backup_is_retried_once() {
    let harness = Harness::new(Fakes {
        backups: FakeBackups {
            failing_creates: 1,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;

    let deployment = harness.deploy(RELEASE).await;

    assert_eq!(deployment.status, Status::Succeeded);
    assert_eq!(harness.backups.creates.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn exhausted_backup_attempts_fail_without_rollback() {
    let harness = Harness::new(Fakes {
        backups: FakeBackups {
            failing_creates: 5,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;

    let deployment = harness.deploy(RELEASE).await;

    assert_eq!(deployment.status, Status::Failed);
    assert_eq!(deployment.backup_id, None);

    let err = deployment.error.unwrap();
    assert_eq!(err.step, Step::Backup);
    assert!(err.message.starts_with("backup failed after 2 attempt(s)"));

    assert_eq!(harness.backups.creates.load(Ordering::SeqCst), 2);
    assert!(harness.backups.restores.lock().unwrap().is_empty());
    assert!(!harness.install_root().join("app").exists());
}

#[tokio::test]
async fn concurrent_deployment_is_rejected() {
    let harness = Harness::new(Fakes {
        maintenance: FakeMaintenance {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        },
        ..Default::default()
    })
    .await;

    let first = harness.request(RELEASE);
    let second = harness.request(&[("app/Other.php", "<?php")]);
    let second_archive = second.artifact.local_path.clone();

    let (first, second) = tokio::join!(
        harness.updater.deploy(first, CancellationToken::new()),
        harness.updater.deploy(second, CancellationToken::new()),
    );

    assert_eq!(first.unwrap().status, Status::Succeeded);
    assert!(matches!(second, Err(DeployError::DeploymentAlreadyRunning)));

    // The rejected request touched nothing.
    assert!(second_archive.exists());
    assert!(!harness.install_root().join("app/Other.php").exists());
    assert_eq!(harness.updater.history(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn in_progress_record_blocks_deployment() {
    let harness = Harness::new(Fakes::default()).await;

    // Another host is mid-deployment against the same database; its process cannot be checked from here.
    let mut running = Deployment::new("1.0.0", "1.0.5");
    running.status = Status::InProgress;
    running.owner = Owner {
        host: "payroll-node-2".into(),
        boot_id: "b7e1".into(),
        pid: 4242,
    }
    .to_string();
    DeploymentHistory::new(harness.db.db.clone(), 10)
        .begin(&running)
        .await
        .unwrap();

    let request = harness.request(RELEASE);
    let archive = request.artifact.local_path.clone();

    let err = harness
        .updater
        .deploy(request, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::DeploymentAlreadyRunning));
    assert!(archive.exists());
    assert_eq!(harness.backups.creates.load(Ordering::SeqCst), 0);

    let status = harness.updater.status().await.unwrap();
    assert!(status.deployment_running);

    // Without force an owner that cannot be checked is left alone.
    assert!(matches!(
        harness.updater.recover(false).await,
        Err(DeployError::DeploymentAlreadyRunning)
    ));

    let closed = harness.updater.recover(true).await.unwrap().unwrap();
    assert_eq!(closed.deployment_id, running.deployment_id);
    assert_eq!(closed.status, Status::Failed);
    assert_eq!(closed.error.unwrap().message, INTERRUPTED_MESSAGE);

    assert!(harness.updater.recover(false).await.unwrap().is_none());
    assert_eq!(harness.deploy(RELEASE).await.status, Status::Succeeded);
}

#[tokio::test]
async fn record_left_by_dead_process_is_closed_and_deployment_runs() {
    let harness = Harness::new(Fakes::default()).await;

    let local = Owner::current();
    let mut stale = Deployment::new("1.0.0", "1.0.5");
    stale.status = Status::InProgress;
    stale.current_step = Step::Apply;
    stale.backup_id = Some("B0".into());
    stale.owner = Owner {
        pid: exited_pid(),
        ..local
    }
    .to_string();
    DeploymentHistory::new(harness.db.db.clone(), 10)
        .begin(&stale)
        .await
        .unwrap();

    let deployment = harness.deploy(RELEASE).await;
    assert_eq!(deployment.status, Status::Succeeded);

    let history = harness.updater.history(None).await.unwrap();
    assert_eq!(history.len(), 2);

    let closed = history
        .iter()
        .find(|d| d.deployment_id == stale.deployment_id)
        .unwrap();
    assert_eq!(closed.status, Status::Failed);
    assert_eq!(closed.backup_id, Some("B0".to_string()));
    assert!(closed.ended > 0);

    let err = closed.error.clone().unwrap();
    assert_eq!(err.step, Step::Apply);
    assert_eq!(err.message, INTERRUPTED_MESSAGE);
    assert_eq!(
        err.details[1],
        "backup B0 is available for a manual restore".to_string()
    );

    // Nothing was restored automatically; the interrupted attempt is left to an operator.
    assert!(harness.backups.restores.lock().unwrap().is_empty());

    let audited = harness.audit.records.lock().unwrap().clone();
    assert_eq!(audited.len(), 2);
    assert_eq!(audited[0].deployment_id, stale.deployment_id);
}

#[tokio::test]
async fn corrupt_archive_rolls_back_without_touching_install() {
    let harness = Harness::new(Fakes::default()).await;

    let request = harness.request(RELEASE);
    std::fs::write(&request.artifact.local_path, b"not a gzip stream").unwrap();

    let deployment = harness
        .updater
        .deploy(request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(deployment.status, Status::RolledBack);
    assert_eq!(deployment.backup_id, Some("B1".to_string()));

    let err = deployment.error.unwrap();
    assert_eq!(err.step, Step::Extract);
    assert!(err.message.starts_with("could not extract update archive"));

    assert_eq!(*harness.backups.restores.lock().unwrap(), vec!["B1".to_string()]);
    assert_eq!(read(&harness.install_root().join("artisan")), "#!/usr/bin/env php");
    assert!(!harness.install_root().join("app").exists());
    assert_eq!(harness.maintenance.runs.load(Ordering::SeqCst), 0);
    assert!(harness.leftover_update_files().is_empty());
}

#[tokio::test]
async fn cancellation_before_backup_fails_cleanly() {
    let harness = Harness::new(Fakes::default()).await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let deployment = harness
        .updater
        .deploy(harness.request(RELEASE), cancel)
        .await
        .unwrap();

    assert_eq!(deployment.status, Status::Failed);

    let err = deployment.error.unwrap();
    assert_eq!(err.step, Step::Precheck);
    assert_eq!(err.message, "cancelled");

    assert_eq!(harness.backups.creates.load(Ordering::SeqCst), 0);
    assert!(harness.leftover_update_files().is_empty());
}

#[tokio::test]
async fn hung_step_times_out_and_rolls_back() {
    let harness = Harness::new(Fakes {
        maintenance: FakeMaintenance {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        },
        ..Default::default()
    })
    .await;

    let deployment = harness.deploy(RELEASE).await;

    assert_eq!(deployment.status, Status::RolledBack);

    let err = deployment.error.unwrap();
    assert_eq!(err.step, Step::PostDeploy);
    assert_eq!(err.message, "step timed out after 1s");
}

#[tokio::test]
async fn timed_out_extraction_stops_before_cleanup() {
    let mut harness = Harness::new(Fakes::default()).await;
    harness
        .updater
        .orchestrator
        .set_step_timeout(Duration::from_millis(1));

    let files: Vec<(String, String)> = (0..5000)
        .map(|i| (format!("release/module-{}/file-{i}.php", i % 50), format!("<?php // {i}")))
        .collect();
    let files: Vec<(&str, &str)> = files
        .iter()
        .map(|(name, contents)| (name.as_str(), contents.as_str()))
        .collect();

    let deployment = harness.deploy(&files).await;

    assert_eq!(deployment.status, Status::RolledBack);

    let err = deployment.error.unwrap();
    assert_eq!(err.step, Step::Extract);
    assert_eq!(err.message, "step timed out after 1ms");

    // The extraction was stopped before cleanup ran, so nothing reappears afterwards.
    assert!(harness.leftover_update_files().is_empty());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(harness.leftover_update_files().is_empty());
    assert!(!harness.install_root().join("release").exists());
}

#[tokio::test]
async fn unverified_artifact_is_rejected() {
    let harness = Harness::new(Fakes::default()).await;

    let mut request = harness.request(RELEASE);
    request.artifact.verified = false;

    let err = harness
        .updater
        .deploy(request, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::UnverifiedArtifact(_)));
    assert!(harness.updater.history(None).await.unwrap().is_empty());
}

fn feed_body(download_url: &str, latest: &str, checksum: &str) -> String {
    serde_json::json!({
        "update_available": true,
        "latest_version": latest,
        "release_date": "2026-10-01",
        "download_url": download_url,
        "changelog": ["Payroll export fixes"],
        "patch_notes": "",
        "is_security_update": false,
        "minimum_runtime_version": "8.1",
        "file_size": null,
        "checksum": checksum
    })
    .to_string()
}

fn release_archive() -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("release.tar.gz");
    build_archive(&path, RELEASE);
    std::fs::read(path).unwrap()
}

#[tokio::test]
async fn checksum_mismatch_never_starts_a_deployment() {
    let mut server = mockito::Server::new_async().await;
    let download_url = format!("{}/releases/1.1.0.tar.gz", server.url());

    server
        .mock("GET", "/check")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(feed_body(&download_url, "1.1.0", "abc123"))
        .create_async()
        .await;
    server
        .mock("GET", "/releases/1.1.0.tar.gz")
        .with_status(200)
        .with_body(release_archive())
        .create_async()
        .await;

    let harness = Harness::with_feed(Fakes::default(), &format!("{}/check", server.url())).await;

    let outcome = harness
        .updater
        .update(false, CancellationToken::new())
        .await
        .unwrap();

    match outcome {
        UpdateOutcome::DownloadFailed { info, error } => {
            assert_eq!(info.latest_version, Some("1.1.0".to_string()));
            assert!(matches!(
                error,
                DownloadError::ChecksumMismatch { ref expected, .. } if expected == "abc123"
            ));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert!(harness.leftover_update_files().is_empty());
    assert!(harness.updater.history(None).await.unwrap().is_empty());
    assert_eq!(harness.backups.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn update_checks_downloads_and_deploys() {
    let archive = release_archive();
    let checksum = {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("release.tar.gz");
        std::fs::write(&path, &archive).unwrap();
        artifacts::sha256_file(&path).unwrap()
    };

    let mut server = mockito::Server::new_async().await;
    let download_url = format!("{}/releases/1.1.0.tar.gz", server.url());

    server
        .mock("GET", "/check")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(feed_body(&download_url, "1.1.0", &checksum))
        .create_async()
        .await;
    server
        .mock("GET", "/releases/1.1.0.tar.gz")
        .with_status(200)
        .with_body(archive)
        .create_async()
        .await;

    let harness = Harness::with_feed(Fakes::default(), &format!("{}/check", server.url())).await;

    let outcome = harness
        .updater
        .update(false, CancellationToken::new())
        .await
        .unwrap();

    let UpdateOutcome::Deployed(deployment) = outcome else {
        panic!("expected a deployment, got {outcome:?}");
    };

    assert_eq!(deployment.status, Status::Succeeded);
    assert_eq!(deployment.target_version, "1.1.0");
    assert!(harness.leftover_update_files().is_empty());

    let status = harness.updater.status().await.unwrap();
    assert_eq!(status.current_version, "1.1.0");
    assert!(status.last_checked.is_some());
    assert!(!status.deployment_running);
    assert_eq!(status.last_deployment, Some(deployment));

    // The cached check was for the old version.
    assert!(status.last_check.is_none());
}

#[tokio::test]
async fn up_to_date_creates_no_record() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/check")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(feed_body("https://unused.example.com", "1.0.0", "abc123"))
        .create_async()
        .await;

    let harness = Harness::with_feed(Fakes::default(), &format!("{}/check", server.url())).await;

    let outcome = harness
        .updater
        .update(false, CancellationToken::new())
        .await
        .unwrap();

    let UpdateOutcome::NoUpdate(info) = outcome else {
        panic!("expected no update, got {outcome:?}");
    };

    assert_eq!(info.reason, Some(check::REASON_UP_TO_DATE.to_string()));
    assert!(harness.updater.history(None).await.unwrap().is_empty());

    let status = harness.updater.status().await.unwrap();
    assert_eq!(status.current_version, "1.0.0");
    assert_eq!(status.last_checked, Some(info.checked_at));
    assert_eq!(status.last_check, Some(info));
}

#[tokio::test]
async fn unconfigured_feed_reports_no_update() {
    let harness = Harness::new(Fakes::default()).await;

    let info = harness.updater.check(false).await.unwrap();

    assert!(!info.available);
    assert_eq!(info.reason, Some(check::REASON_NOT_CONFIGURED.to_string()));
    assert_eq!(info.current_version, "1.0.0");
    assert_eq!(harness.updater.status().await.unwrap().last_checked, None);
}
