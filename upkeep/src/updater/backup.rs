use crate::updater::fsutil;
use async_trait::async_trait;
use std::{
    fmt::Debug,
    fs::File,
    io,
    path::{Path, PathBuf},
    process::Stdio,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};
use uuid::Uuid;

/// Name of the database dump inside a snapshot directory.
pub const DATABASE_DUMP: &str = "database.dump";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup '{0}' does not exist")]
    NotFound(String),

    #[error("could not {action} backup; {source}")]
    Io {
        action: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("database {action} command '{command}' failed; {message}")]
    Database {
        action: &'static str,
        command: String,
        message: String,
    },

    #[error("backup cancelled")]
    Cancelled,

    #[error("backup task did not complete; {0}")]
    Task(String),
}

/// Captures and restores the state of the live installation.
#[async_trait]
pub trait BackupService: Debug + Send + Sync + 'static {
    /// Takes a backup and returns an opaque handle for it. Once `cancel` fires the backup stops, removes anything
    /// it wrote and returns `BackupError::Cancelled`.
    async fn create_backup(&self, cancel: &CancellationToken) -> Result<String, BackupError>;

    async fn restore(&self, backup_id: &str) -> Result<(), BackupError>;
}

/// Commands that dump the application's database into a snapshot and replay it on restore. The dump command's
/// stdout is written to the snapshot; the restore command reads the same file on stdin. Empty commands disable
/// the hook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseHooks {
    pub dump_command: String,
    pub restore_command: String,
}

/// Snapshots the install root into `<backups_dir>/<backup_id>`, along with a database dump when hooks are
/// configured. The storage root and the backups directory itself are never part of a snapshot, and a restore
/// leaves them alone.
#[derive(Debug, Clone)]
pub struct DirectoryBackupService {
    install_root: PathBuf,
    backups_dir: PathBuf,
    excludes: Vec<PathBuf>,
    database: DatabaseHooks,
}

impl DirectoryBackupService {
    pub fn new(install_root: PathBuf, storage_root: PathBuf, backups_dir: PathBuf) -> Self {
        Self {
            install_root,
            excludes: vec![backups_dir.clone(), storage_root],
            backups_dir,
            database: DatabaseHooks::default(),
        }
    }

    pub fn with_database(mut self, hooks: DatabaseHooks) -> Self {
        self.database = hooks;
        self
    }

    pub fn snapshot_path(&self, backup_id: &str) -> PathBuf {
        self.backups_dir.join(backup_id)
    }

    async fn snapshot_files(
        &self,
        snapshot: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, BackupError> {
        let install_root = self.install_root.clone();
        let excludes = self.excludes.clone();
        let snapshot = snapshot.to_path_buf();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || fsutil::copy_tree(&install_root, &snapshot, &excludes, &cancel))
            .await
            .map_err(|e| BackupError::Task(e.to_string()))?
            .map_err(|source| match source.kind() {
                io::ErrorKind::Interrupted => BackupError::Cancelled,
                _ => BackupError::Io {
                    action: "create",
                    source,
                },
            })
    }

    async fn dump_database(&self, snapshot: &Path, cancel: &CancellationToken) -> Result<(), BackupError> {
        let command = self.database.dump_command.trim();
        if command.is_empty() {
            return Ok(());
        }

        let dump = File::create(snapshot.join(DATABASE_DUMP)).map_err(|e| BackupError::Database {
            action: "dump",
            command: command.into(),
            message: e.to_string(),
        })?;

        run_hook(
            "dump",
            command,
            &self.install_root,
            Stdio::null(),
            Stdio::from(dump),
            cancel,
        )
        .await
    }

    async fn restore_database(&self, snapshot: &Path) -> Result<(), BackupError> {
        let command = self.database.restore_command.trim();
        if command.is_empty() {
            return Ok(());
        }

        let dump = File::open(snapshot.join(DATABASE_DUMP)).map_err(|e| BackupError::Database {
            action: "restore",
            command: command.into(),
            message: format!("could not open database dump; {e}"),
        })?;

        run_hook(
            "restore",
            command,
            &self.install_root,
            Stdio::from(dump),
            Stdio::null(),
            &CancellationToken::new(),
        )
        .await
    }
}

/// Runs a database hook command from the install root. Stderr is reported when the command fails.
async fn run_hook(
    action: &'static str,
    command: &str,
    working_dir: &Path,
    stdin: Stdio,
    stdout: Stdio,
    cancel: &CancellationToken,
) -> Result<(), BackupError> {
    let failed = |message: String| BackupError::Database {
        action,
        command: command.into(),
        message,
    };

    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return Err(failed("command is empty".into()));
    };

    debug!(command = %command, action, "Running database hook");

    let mut hook = tokio::process::Command::new(program);
    hook.args(parts)
        .current_dir(working_dir)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::select! {
        output = hook.output() => output.map_err(|e| failed(e.to_string()))?,
        _ = cancel.cancelled() => return Err(BackupError::Cancelled),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(failed(format!(
            "exited with code {}: {stderr}",
            output
                .status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "none".into())
        )));
    }

    Ok(())
}

#[async_trait]
impl BackupService for DirectoryBackupService {
    #[instrument(skip(self, cancel), fields(origin = "updater::backup"))]
    async fn create_backup(&self, cancel: &CancellationToken) -> Result<String, BackupError> {
        let backup_id = Uuid::now_v7().to_string();
        let snapshot = self.snapshot_path(&backup_id);

        let result = async {
            let copied = self.snapshot_files(&snapshot, cancel).await?;
            self.dump_database(&snapshot, cancel).await?;
            Ok::<u64, BackupError>(copied)
        }
        .await;

        let copied = match result {
            Ok(copied) => copied,
            Err(e) => {
                // Never leave a half written snapshot behind.
                if let Err(remove_err) = fsutil::remove_path(&snapshot) {
                    error!(backup_id = %backup_id, error = %remove_err, "Could not remove incomplete backup");
                }
                return Err(e);
            }
        };

        debug!(backup_id = %backup_id, files = copied, "Created backup");

        Ok(backup_id)
    }

    #[instrument(skip(self), fields(origin = "updater::backup"))]
    async fn restore(&self, backup_id: &str) -> Result<(), BackupError> {
        let snapshot = self.snapshot_path(backup_id);

        if backup_id.is_empty() || !snapshot.is_dir() {
            return Err(BackupError::NotFound(backup_id.into()));
        }

        let install_root = self.install_root.clone();
        let excludes = self.excludes.clone();
        let files = snapshot.clone();

        tokio::task::spawn_blocking(move || {
            fsutil::clear_dir(&install_root, &excludes)?;
            fsutil::copy_tree(
                &files,
                &install_root,
                &[files.join(DATABASE_DUMP)],
                &CancellationToken::new(),
            )
        })
        .await
        .map_err(|e| BackupError::Task(e.to_string()))?
        .map_err(|source| BackupError::Io {
            action: "restore",
            source,
        })?;

        self.restore_database(&snapshot).await?;

        debug!(backup_id = %backup_id, "Restored backup");

        Ok(())
    }
}
