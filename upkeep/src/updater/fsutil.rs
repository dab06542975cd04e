//! Blocking filesystem helpers shared by apply, backup and restore. Callers run these inside `spawn_blocking`.

use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

fn is_excluded(path: &Path, excludes: &[PathBuf]) -> bool {
    excludes.iter().any(|exclude| path.starts_with(exclude))
}

/// Copies everything under `src` into `dst`, preserving relative paths and creating intermediate directories.
/// Paths under any of `excludes` are skipped. Stops at the first error, leaving whatever was already copied in place.
/// Returns the amount of files copied.
///
/// `cancel` is checked before every entry; once it fires the copy stops with `ErrorKind::Interrupted`.
pub fn copy_tree(
    src: &Path,
    dst: &Path,
    excludes: &[PathBuf],
    cancel: &CancellationToken,
) -> io::Result<u64> {
    fs::create_dir_all(dst)?;

    let mut copied = 0;

    let walker = WalkDir::new(src)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_excluded(entry.path(), excludes));

    for entry in walker {
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "copy cancelled"));
        }

        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dst.join(relative);

        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if fs::symlink_metadata(&target).is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }

        copied += 1;
    }

    Ok(copied)
}

/// Removes everything inside `root` except paths under `excludes`. Directories that contain an excluded path are
/// descended into rather than removed.
pub fn clear_dir(root: &Path, excludes: &[PathBuf]) -> io::Result<()> {
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();

        if is_excluded(&path, excludes) {
            continue;
        }

        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if excludes.iter().any(|exclude| exclude.starts_with(&path)) {
                clear_dir(&path, excludes)?;
            } else {
                fs::remove_dir_all(&path)?;
            }
        } else {
            fs::remove_file(&path)?;
        }
    }

    Ok(())
}

/// Removes a file or directory tree. A path that is already gone is not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}
