use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::storage::atomic::write_json_atomic;
use crate::storage::{TraceFilter, TraceRecord, TraceStore, TraceStoreError, validate_trace_id};

/// File-based trace store. Each run is stored as a separate JSON file.
pub struct JsonTraceStore {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

impl JsonTraceStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, trace_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", trace_id))
    }

    async fn read_record(&self, path: &Path) -> Result<TraceRecord, TraceStoreError> {
        let data = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Every readable record, newest first.
    async fn read_all(&self) -> Result<Vec<(PathBuf, TraceRecord)>, TraceStoreError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_record(&path).await {
                Ok(record) => records.push((path, record)),
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable trace file"),
            }
        }

        records.sort_by(|(_, a), (_, b)| b.ts.cmp(&a.ts).then_with(|| b.trace_id.cmp(&a.trace_id)));
        Ok(records)
    }
}

#[async_trait]
impl TraceStore for JsonTraceStore {
    async fn save(&self, record: &TraceRecord) -> Result<(), TraceStoreError> {
        validate_trace_id(&record.trace_id)?;
        let _lock = self.lock.write().await;
        write_json_atomic(&self.record_path(&record.trace_id), record).await?;
        Ok(())
    }

    async fn get(&self, trace_id: &str) -> Result<Option<TraceRecord>, TraceStoreError> {
        validate_trace_id(trace_id)?;
        let _lock = self.lock.read().await;
        let path = self.record_path(trace_id);
        match self.read_record(&path).await {
            Ok(record) => Ok(Some(record)),
            Err(TraceStoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, filter: &TraceFilter) -> Result<Vec<TraceRecord>, TraceStoreError> {
        let _lock = self.lock.read().await;
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| filter.matches(record))
            .take(filter.limit)
            .collect())
    }

    async fn prune(&self, keep_per_skill: usize) -> Result<usize, TraceStoreError> {
        let _lock = self.lock.write().await;
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut deleted = 0;

        for (path, record) in self.read_all().await? {
            let count = seen.entry(record.skill.clone()).or_insert(0);
            *count += 1;
            if *count <= keep_per_skill {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to prune trace"),
            }
        }

        debug!(deleted, keep_per_skill, "Trace store pruned");
        Ok(deleted)
    }
}
