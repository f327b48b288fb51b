use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::storage::{TraceFilter, TraceRecord, TraceStore, TraceStoreError, validate_trace_id};

/// In-memory trace store for embedded runs and tests.
/// Holds records only for the lifetime of the store instance.
#[derive(Default)]
pub struct MemoryTraceStore {
    records: Mutex<HashMap<String, TraceRecord>>,
}

impl MemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, TraceRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn newest_first(&self) -> Vec<TraceRecord> {
        let mut all: Vec<TraceRecord> = self.records().values().cloned().collect();
        all.sort_by(|a, b| b.ts.cmp(&a.ts).then_with(|| b.trace_id.cmp(&a.trace_id)));
        all
    }
}

#[async_trait]
impl TraceStore for MemoryTraceStore {
    async fn save(&self, record: &TraceRecord) -> Result<(), TraceStoreError> {
        validate_trace_id(&record.trace_id)?;
        self.records()
            .insert(record.trace_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, trace_id: &str) -> Result<Option<TraceRecord>, TraceStoreError> {
        validate_trace_id(trace_id)?;
        Ok(self.records().get(trace_id).cloned())
    }

    async fn list(&self, filter: &TraceFilter) -> Result<Vec<TraceRecord>, TraceStoreError> {
        Ok(self
            .newest_first()
            .into_iter()
            .filter(|r| filter.matches(r))
            .take(filter.limit)
            .collect())
    }

    async fn prune(&self, keep_per_skill: usize) -> Result<usize, TraceStoreError> {
        let mut seen: HashMap<String, usize> = HashMap::new();
        let doomed: Vec<String> = self
            .newest_first()
            .into_iter()
            .filter(|r| {
                let count = seen.entry(r.skill.clone()).or_insert(0);
                *count += 1;
                *count > keep_per_skill
            })
            .map(|r| r.trace_id)
            .collect();

        let mut records = self.records();
        for id in &doomed {
            records.remove(id);
        }
        Ok(doomed.len())
    }
}
