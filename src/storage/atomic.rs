//! Crash-consistent file primitives.
//!
//! Every write goes to a temporary sibling, is flushed with `fsync`, and is
//! then renamed over the target. On the same filesystem a reader observes
//! either the old complete file or the new complete file.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Content written to a temp sibling of `target` but not yet renamed into place.
///
/// Dropping a stage without committing removes the temp file and leaves the
/// target untouched.
#[derive(Debug)]
pub struct StagedWrite {
    target: PathBuf,
    tmp: PathBuf,
    done: bool,
}

impl StagedWrite {
    /// Write and fsync `data` into a temp sibling of `target`.
    pub async fn stage(target: &Path, data: &[u8]) -> Result<Self> {
        let parent = parent_dir(target);
        tokio::fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid target path: {}", target.display()))?;
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let tmp = parent.join(format!(".{}.{}.tmp", file_name, &suffix[..8]));

        let staged = Self {
            target: target.to_path_buf(),
            tmp,
            done: false,
        };

        let mut file = tokio::fs::File::create(&staged.tmp)
            .await
            .with_context(|| format!("Failed to create temp file: {}", staged.tmp.display()))?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all()
            .await
            .with_context(|| format!("Failed to fsync temp file: {}", staged.tmp.display()))?;

        Ok(staged)
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn temp_path(&self) -> &Path {
        &self.tmp
    }

    /// Rename the temp file over the target and fsync the directory.
    pub async fn commit(mut self) -> Result<()> {
        tokio::fs::rename(&self.tmp, &self.target)
            .await
            .with_context(|| format!("Failed to rename into place: {}", self.target.display()))?;
        self.done = true;
        sync_dir(&parent_dir(&self.target)).await;
        debug!(path = %self.target.display(), "Atomic write committed");
        Ok(())
    }

    /// Discard the temp file.
    pub async fn abandon(mut self) -> Result<()> {
        self.done = true;
        match tokio::fs::remove_file(&self.tmp).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.done
            && let Err(e) = std::fs::remove_file(&self.tmp)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.tmp.display(), error = %e, "Failed to remove abandoned temp file");
        }
    }
}

/// Atomically replace `target` with `data`.
pub async fn write_atomic(target: &Path, data: &[u8]) -> Result<()> {
    StagedWrite::stage(target, data).await?.commit().await
}

/// Atomically replace `target` with pretty-printed JSON.
pub async fn write_json_atomic<T: Serialize + ?Sized>(target: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_vec_pretty(value)?;
    buf.push(b'\n');
    write_atomic(target, &buf).await
}

/// Sibling path a backup of `target` taken at `at` is written to.
pub fn backup_path(target: &Path, at: DateTime<Utc>) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stamp = at.format("%Y%m%dT%H%M%S%3fZ");
    parent_dir(target).join(format!("{}.{}.bak", name, stamp))
}

/// Copy `target` to a timestamped sibling before it gets overwritten.
///
/// Returns `None` when there is nothing to back up.
pub async fn backup_file(target: &Path, at: DateTime<Utc>) -> Result<Option<PathBuf>> {
    let data = match tokio::fs::read(target).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read for backup: {}", target.display()));
        }
    };
    let backup = backup_path(target, at);
    write_atomic(&backup, &data)
        .await
        .with_context(|| format!("Failed to write backup: {}", backup.display()))?;
    debug!(target = %target.display(), backup = %backup.display(), "Backup taken");
    Ok(Some(backup))
}

/// Copy a backup back over its target.
pub async fn restore_file(backup: &Path, target: &Path) -> Result<()> {
    let data = tokio::fs::read(backup)
        .await
        .with_context(|| format!("Failed to read backup: {}", backup.display()))?;
    write_atomic(target, &data)
        .await
        .with_context(|| format!("Failed to restore: {}", target.display()))
}

/// Remove a file, reporting whether it existed.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            sync_dir(&parent_dir(path)).await;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove: {}", path.display())),
    }
}

/// Whether files can be created in `dir`, checked by writing and removing a probe file.
pub async fn probe_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".probe-{}", uuid::Uuid::new_v4().simple()));
    match tokio::fs::write(&probe, b"probe").await {
        Ok(()) => {
            if let Err(e) = tokio::fs::remove_file(&probe).await {
                warn!(path = %probe.display(), error = %e, "Failed to remove write probe");
            }
            true
        }
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Directory is not writable");
            false
        }
    }
}

/// Whether `dir` is a directory its permissions allow writing to.
///
/// Reads metadata only; nothing is created.
pub async fn writable_hint(dir: &Path) -> bool {
    match tokio::fs::metadata(dir).await {
        Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Directory metadata unavailable");
            false
        }
    }
}

/// Delete backups of `target` other than those listed in `keep`.
///
/// Returns how many were removed.
pub async fn prune_backups(target: &Path, keep: &[&Path]) -> Result<usize> {
    let Some(name) = target.file_name().map(|n| n.to_string_lossy().to_string()) else {
        return Ok(0);
    };
    let prefix = format!("{}.", name);
    let dir = parent_dir(target);

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Failed to list: {}", dir.display())),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(stamp) = file_name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".bak"))
        else {
            continue;
        };
        if stamp.is_empty() || stamp.contains('.') {
            continue;
        }
        let path = entry.path();
        if keep.iter().any(|k| *k == path.as_path()) {
            continue;
        }
        if remove_if_exists(&path).await? {
            debug!(backup = %path.display(), "Stale backup removed");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex SHA-256 of a file's contents.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read: {}", path.display()))?;
    Ok(sha256_hex(&data))
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

// Persists the rename itself. Best effort: some filesystems refuse to fsync a directory.
#[cfg(unix)]
async fn sync_dir(dir: &Path) {
    let result = match tokio::fs::File::open(dir).await {
        Ok(f) => f.sync_all().await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        debug!(dir = %dir.display(), error = %e, "Directory fsync skipped");
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) {}
