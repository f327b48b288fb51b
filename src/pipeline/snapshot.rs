use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::pipeline::fs_adapters::IndexSource;
use crate::pipeline::{BuildOutcome, PipelineCtx, ScoreOutcome};

/// Index source reading a JSON array of entries from a file.
///
/// Each entry must be an object with a string `id`; an optional numeric
/// `score` becomes the entry's score, clamped to 0..=100.
pub struct SnapshotSource {
    path: PathBuf,
}

impl SnapshotSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl IndexSource for SnapshotSource {
    async fn build(&self, _ctx: &PipelineCtx) -> Result<BuildOutcome> {
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read snapshot: {}", self.path.display()))?;
        let parsed: Value = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse snapshot: {}", self.path.display()))?;
        let Value::Array(entries) = parsed else {
            bail!("Snapshot {} must be a JSON array", self.path.display());
        };

        for (i, entry) in entries.iter().enumerate() {
            if entry.get("id").and_then(|v| v.as_str()).is_none() {
                bail!("Snapshot entry {} has no string 'id'", i);
            }
        }

        let count = entries.len();
        Ok(BuildOutcome {
            index_payload: serde_json::json!({ "entries": entries, "count": count }),
            index_count: count,
            note: format!("indexed {} entries from {}", count, self.path.display()),
        })
    }

    async fn score(&self, ctx: &PipelineCtx) -> Result<ScoreOutcome> {
        let entries = ctx
            .index_payload
            .as_ref()
            .and_then(|index| index.get("entries"))
            .and_then(|e| e.as_array())
            .context("Index payload has no entries")?;

        let mut scores = Map::new();
        for entry in entries {
            let Some(id) = entry.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let score = entry
                .get("score")
                .and_then(|v| v.as_f64())
                .filter(|s| s.is_finite())
                .unwrap_or(0.0)
                .clamp(0.0, 100.0);
            scores.insert(id.to_string(), serde_json::json!(score));
        }

        let scored = scores.len();
        Ok(ScoreOutcome {
            scores_payload: Value::Object(scores),
            scored_count: scored,
            note: format!("scored {} entries", scored),
        })
    }
}
