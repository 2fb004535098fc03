//! File backup and restore.
//!
//! Plain synchronous copies with the existence checks a recovery session
//! needs: a missing source is a hard [`RecoveryError::PathNotFound`] rather
//! than a silent no-op, and nothing is touched on disk in that case.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{RecoveryError, Result};
use crate::journal::Journal;

/// Copies `source` into `backup_dir`, returning the path of the copy.
///
/// If `backup_dir` is an existing directory the copy keeps the source's file
/// name inside it; otherwise `backup_dir` is treated as the destination path
/// itself.
pub fn backup(journal: &Journal, source: &Path, backup_dir: &Path) -> Result<PathBuf> {
    if !source.exists() {
        let err = RecoveryError::PathNotFound(source.to_path_buf());
        journal.error(format!("backup skipped: {err}"));
        return Err(err);
    }

    let dest = destination_for(source, backup_dir);
    if let Err(e) = fs::copy(source, &dest) {
        let err = RecoveryError::io(
            format!("backing up {} to {}", source.display(), dest.display()),
            e,
        );
        journal.error(err.to_string());
        return Err(err);
    }

    journal.info(format!(
        "backed up {} to {}",
        source.display(),
        dest.display()
    ));
    Ok(dest)
}

/// Copies a backup back to `target`, returning the restored path.
///
/// Destination semantics match [`backup`]: an existing directory receives
/// the file under its own name.
pub fn restore(journal: &Journal, backup: &Path, target: &Path) -> Result<PathBuf> {
    if !backup.exists() {
        let err = RecoveryError::PathNotFound(backup.to_path_buf());
        journal.error(format!("restore skipped: {err}"));
        return Err(err);
    }

    let dest = destination_for(backup, target);
    if let Err(e) = fs::copy(backup, &dest) {
        let err = RecoveryError::io(
            format!("restoring {} to {}", backup.display(), dest.display()),
            e,
        );
        journal.error(err.to_string());
        return Err(err);
    }

    journal.info(format!(
        "restored {} to {}",
        backup.display(),
        dest.display()
    ));
    Ok(dest)
}

fn destination_for(source: &Path, dest: &Path) -> PathBuf {
    if dest.is_dir() {
        dest.join(source.file_name().unwrap_or_default())
    } else {
        dest.to_path_buf()
    }
}
