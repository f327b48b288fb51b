use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Default age after which an abandoned lock may be taken over.
pub const DEFAULT_STALE_AFTER_SECS: i64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockHolder {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Advisory lock serializing pipeline runs over one artifact set.
///
/// The lock file holds the owner's pid and acquisition time and is removed
/// when the guard is dropped.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory: {}", parent.display()))?;
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let holder = LockHolder {
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    file.write_all(serde_json::to_string(&holder)?.as_bytes())?;
                    file.sync_all()?;
                    info!(lock = %path.display(), pid = holder.pid, "Lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let age = lock_age(path)?;
                    if age < stale_after {
                        let owner = std::fs::read_to_string(path)
                            .ok()
                            .and_then(|s| serde_json::from_str::<LockHolder>(&s).ok());
                        match owner {
                            Some(h) => bail!(
                                "Lock {} held by pid {} since {}",
                                path.display(),
                                h.pid,
                                h.acquired_at.to_rfc3339()
                            ),
                            None => bail!("Lock {} is held", path.display()),
                        }
                    }
                    warn!(lock = %path.display(), age_secs = age.num_seconds(), "Taking over stale lock");
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create lock: {}", path.display()));
                }
            }
        }

        bail!("Lock {} is contended", path.display())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(lock = %self.path.display(), "Lock released"),
            Err(e) => warn!(lock = %self.path.display(), error = %e, "Failed to release lock"),
        }
    }
}

fn lock_age(path: &Path) -> Result<Duration> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("Failed to stat lock: {}", path.display()))?;
    let modified: DateTime<Utc> = modified.into();
    Ok(Utc::now() - modified)
}
