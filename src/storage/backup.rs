//! Point-in-time backups of a vector store.
//!
//! A backup is itself a complete store directory (`CURRENT`, one snapshot and
//! an empty WAL), so restoring is just opening it with
//! [`VectorStore::open`](super::VectorStore::open).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;

use super::log::{self, Durability, WalWriter};
use crate::error::{StorageError, StorageResult};
use crate::vector::Vector;

/// Directory name prefix for timestamped backups.
pub const BACKUP_PREFIX: &str = "backup_";

/// Returns `backup_YYYYMMDD_HHMMSS` for the current local time.
pub fn timestamped_backup_name() -> String {
    format!("{BACKUP_PREFIX}{}", Local::now().format("%Y%m%d_%H%M%S"))
}

/// Makes `path` absolute with symlinks resolved, including the parts that do
/// not exist yet.
fn resolve(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }
    let mut resolved = existing.canonicalize()?;
    resolved.extend(missing.into_iter().rev());
    Ok(resolved)
}

/// Fails when `dest` is the live store directory, contains it, or lies inside it.
fn ensure_outside_store(dest: &Path, store_dir: &Path) -> StorageResult<()> {
    let resolved = |path: &Path| {
        resolve(path).map_err(|source| StorageError::Backup {
            path: path.to_path_buf(),
            source,
        })
    };
    let dest_resolved = resolved(dest)?;
    let store_resolved = resolved(store_dir)?;
    if dest_resolved.starts_with(&store_resolved) || store_resolved.starts_with(&dest_resolved) {
        return Err(StorageError::BackupOverlapsStore {
            dest: dest.to_path_buf(),
            store: store_dir.to_path_buf(),
        });
    }
    Ok(())
}

/// Writes `vectors` as a self-contained store directory at `dest`.
///
/// An existing destination is replaced, never merged into. `dest` must not
/// overlap `store_dir`, the directory of the store being backed up.
pub(crate) fn write_backup(
    dest: &Path,
    store_dir: &Path,
    vectors: &[Arc<Vector>],
    compression: bool,
) -> StorageResult<()> {
    ensure_outside_store(dest, store_dir)?;

    let backup_err = |source| StorageError::Backup {
        path: dest.to_path_buf(),
        source,
    };

    if dest.exists() {
        fs::remove_dir_all(dest).map_err(backup_err)?;
    }
    fs::create_dir_all(dest).map_err(backup_err)?;

    log::write_snapshot(dest, 0, vectors, compression)?;
    let mut wal = WalWriter::open(log::wal_path(dest, 0), Durability::Sync)?;
    wal.sync()?;
    log::write_current(dest, 0)?;

    tracing::info!(
        path = %dest.display(),
        vectors = vectors.len(),
        "backup created"
    );
    Ok(())
}

/// Removes the oldest `backup_*` directories under `base`, keeping the newest
/// `keep`. Returns the removed paths, oldest first.
pub fn prune_backups(base: &Path, keep: usize) -> StorageResult<Vec<PathBuf>> {
    if !base.exists() {
        return Ok(Vec::new());
    }

    let backup_err = |source| StorageError::Backup {
        path: base.to_path_buf(),
        source,
    };

    let mut backups = Vec::new();
    for entry in fs::read_dir(base).map_err(backup_err)? {
        let entry = entry.map_err(backup_err)?;
        let is_backup = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(BACKUP_PREFIX));
        if is_backup && entry.path().is_dir() {
            backups.push(entry.path());
        }
    }

    // Timestamped names sort chronologically.
    backups.sort();
    let excess = backups.len().saturating_sub(keep);
    let removed: Vec<PathBuf> = backups.into_iter().take(excess).collect();
    for path in &removed {
        fs::remove_dir_all(path).map_err(|source| StorageError::Backup {
            path: path.clone(),
            source,
        })?;
        tracing::info!(path = %path.display(), "removed old backup");
    }
    Ok(removed)
}
