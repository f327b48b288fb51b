use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::storage::atomic::{sha256_file, write_json_atomic};

/// The durable record of the most recently committed artifact set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastGoodPointer {
    pub updated_at: DateTime<Utc>,
    pub index_path: PathBuf,
    pub scores_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_backup_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores_backup_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores_sha256: Option<String>,
}

impl LastGoodPointer {
    /// Seconds since the pointer was committed, as of `now`.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.updated_at).num_seconds()
    }

    /// Recompute artifact checksums and list every mismatch or unreadable artifact.
    pub async fn verify(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let checks = [
            (&self.index_path, &self.index_sha256),
            (&self.scores_path, &self.scores_sha256),
        ];
        for (path, expected) in checks {
            match sha256_file(path).await {
                Ok(actual) => {
                    if let Some(expected) = expected
                        && expected != &actual
                    {
                        problems.push(format!(
                            "{}: checksum {} does not match recorded {}",
                            path.display(),
                            actual,
                            expected
                        ));
                    }
                }
                Err(e) => problems.push(format!("{:#}", e)),
            }
        }
        problems
    }
}

/// Read the pointer; `None` if it was never committed.
pub async fn load_pointer(path: &Path) -> Result<Option<LastGoodPointer>> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read pointer: {}", path.display()));
        }
    };
    let pointer = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse pointer: {}", path.display()))?;
    Ok(Some(pointer))
}

/// Atomically replace the pointer.
pub async fn commit_pointer(path: &Path, pointer: &LastGoodPointer) -> Result<()> {
    write_json_atomic(path, pointer)
        .await
        .with_context(|| format!("Failed to commit pointer: {}", path.display()))?;
    info!(
        pointer = %path.display(),
        index = %pointer.index_path.display(),
        scores = %pointer.scores_path.display(),
        "Last-good pointer committed"
    );
    Ok(())
}
