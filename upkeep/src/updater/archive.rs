use flate2::read::GzDecoder;
use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};
use tar::{Archive, EntryType};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("could not prepare staging directory; {0}")]
    Staging(#[source] io::Error),

    #[error("archive is corrupt or unreadable; {0}")]
    Corrupt(#[source] io::Error),

    #[error("archive entry '{0}' would be written outside of the staging directory")]
    UnsafeEntry(String),

    #[error("archive entry '{path}' has unsupported type {kind:?}")]
    UnsupportedEntry { path: String, kind: EntryType },

    #[error("archive contains no entries")]
    Empty,

    #[error("extraction cancelled")]
    Cancelled,
}

/// Returns a unique, time-stamped staging directory name under the updates area.
pub fn staging_dir(updates_dir: &Path, epoch_milli: u64, deployment_id: &str) -> PathBuf {
    updates_dir.join(format!("staging-{epoch_milli}-{deployment_id}"))
}

/// Unpacks a gzipped tarball into `staging`. Entries that would land outside the staging
/// directory, hard links and device files are rejected. Returns the amount of entries unpacked.
///
/// Stops with `ArchiveError::Cancelled` before the next entry once `cancel` fires.
pub fn extract(
    archive_path: &Path,
    staging: &Path,
    cancel: &CancellationToken,
) -> Result<u64, ArchiveError> {
    let file = File::open(archive_path).map_err(ArchiveError::Corrupt)?;

    std::fs::create_dir_all(staging).map_err(ArchiveError::Staging)?;

    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut unpacked = 0;

    for entry in archive.entries().map_err(ArchiveError::Corrupt)? {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        let mut entry = entry.map_err(ArchiveError::Corrupt)?;

        let path = entry
            .path()
            .map(|path| path.display().to_string())
            .map_err(ArchiveError::Corrupt)?;

        let kind = entry.header().entry_type();
        if !matches!(
            kind,
            EntryType::Regular | EntryType::Directory | EntryType::Symlink
        ) {
            return Err(ArchiveError::UnsupportedEntry { path, kind });
        }

        if !entry.unpack_in(staging).map_err(ArchiveError::Corrupt)? {
            return Err(ArchiveError::UnsafeEntry(path));
        }

        unpacked += 1;
    }

    if unpacked == 0 {
        return Err(ArchiveError::Empty);
    }

    Ok(unpacked)
}
