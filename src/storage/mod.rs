pub mod atomic;
pub mod json_store;
pub mod lock;
pub mod memory_store;
pub mod pointer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::types::{RunResult, StateId, TraceEvent};

/// Returned by [`record`] when the run could not be persisted.
pub const UNRECORDED_TRACE_ID: &str = "unrecorded";

const PREFIX_MAX: usize = 12;
const TIMESTAMP_WIDTH: usize = 9;

#[derive(Debug, Error)]
pub enum TraceStoreError {
    #[error("malformed trace id: {0:?}")]
    MalformedId(String),

    #[error("trace store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("trace record encoding error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("trace store error: {0:#}")]
    Other(#[from] anyhow::Error),
}

/// Durable, summarized form of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: String,
    pub skill: String,
    pub version: String,
    pub ok: bool,
    #[serde(rename = "startState")]
    pub start_state: String,
    #[serde(rename = "endState")]
    pub end_state: String,
    pub steps: usize,
    pub ts: DateTime<Utc>,
    pub ctx_summary: serde_json::Value,
    pub trace: Vec<TraceEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl TraceRecord {
    pub fn from_run<S: StateId, C: Serialize>(trace_id: String, result: &RunResult<S, C>) -> Self {
        let ctx_summary = match serde_json::to_value(&result.ctx) {
            Ok(value) => summarize(&value),
            Err(e) => {
                warn!(spec = %result.spec, error = %e, "Context not serializable; summary dropped");
                serde_json::Value::Null
            }
        };
        Self {
            trace_id,
            skill: result.spec.clone(),
            version: result.version.clone(),
            ok: result.ok,
            start_state: result.start.name().to_string(),
            end_state: result.end.name().to_string(),
            steps: result.steps,
            ts: Utc::now(),
            ctx_summary,
            trace: result.trace.clone(),
            note: result.note.clone(),
        }
    }
}

/// Listing filter.
#[derive(Debug, Clone)]
pub struct TraceFilter {
    pub skill_prefix: Option<String>,
    pub limit: usize,
}

impl Default for TraceFilter {
    fn default() -> Self {
        Self {
            skill_prefix: None,
            limit: 20,
        }
    }
}

impl TraceFilter {
    pub fn matches(&self, record: &TraceRecord) -> bool {
        self.skill_prefix
            .as_deref()
            .is_none_or(|prefix| record.skill.starts_with(prefix))
    }
}

/// Trait for run trace persistence.
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Persist a record under its `trace_id`.
    async fn save(&self, record: &TraceRecord) -> Result<(), TraceStoreError>;

    /// Fetch one record. Malformed ids are an error, unknown ids are `None`.
    async fn get(&self, trace_id: &str) -> Result<Option<TraceRecord>, TraceStoreError>;

    /// Records matching the filter, newest first.
    async fn list(&self, filter: &TraceFilter) -> Result<Vec<TraceRecord>, TraceStoreError>;

    /// Keep the newest `keep_per_skill` records of each specification; return how many were deleted.
    async fn prune(&self, keep_per_skill: usize) -> Result<usize, TraceStoreError>;
}

/// Persist a finished run and return its trace id.
///
/// Never fails: on error the problem is logged and [`UNRECORDED_TRACE_ID`] is returned.
pub async fn record<S: StateId, C: Serialize>(
    store: &dyn TraceStore,
    result: &RunResult<S, C>,
) -> String {
    let trace_id = new_trace_id(&result.spec, Utc::now());
    let record = TraceRecord::from_run(trace_id.clone(), result);
    match store.save(&record).await {
        Ok(()) => {
            info!(trace_id = %trace_id, spec = %result.spec, ok = result.ok, "Run trace recorded");
            trace_id
        }
        Err(e) => {
            warn!(spec = %result.spec, error = %e, "Failed to record run trace");
            UNRECORDED_TRACE_ID.to_string()
        }
    }
}

/// `<prefix>.<base36 millis>.<4 hex>`; sorts by time within one prefix.
pub fn new_trace_id(skill: &str, now: DateTime<Utc>) -> String {
    let millis = u64::try_from(now.timestamp_millis()).unwrap_or(0);
    let random = uuid::Uuid::new_v4();
    format!(
        "{}.{}.{}",
        trace_prefix(skill),
        to_base36(millis, TIMESTAMP_WIDTH),
        hex::encode(&random.as_bytes()[..2])
    )
}

/// Check that `id` has the shape produced by [`new_trace_id`].
pub fn validate_trace_id(id: &str) -> Result<(), TraceStoreError> {
    let malformed = || TraceStoreError::MalformedId(id.to_string());
    let mut parts = id.split('.');
    let (Some(prefix), Some(stamp), Some(suffix), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };

    let prefix_ok = (1..=PREFIX_MAX).contains(&prefix.len())
        && prefix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    let stamp_ok = (1..=13).contains(&stamp.len())
        && stamp
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    let suffix_ok = suffix.len() == 4
        && suffix
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

    if prefix_ok && stamp_ok && suffix_ok {
        Ok(())
    } else {
        Err(malformed())
    }
}

fn trace_prefix(skill: &str) -> String {
    let mut prefix = String::new();
    for c in skill.chars() {
        if prefix.len() == PREFIX_MAX {
            break;
        }
        if c.is_ascii_alphanumeric() {
            prefix.push(c.to_ascii_lowercase());
        } else if !prefix.is_empty() && !prefix.ends_with('-') {
            prefix.push('-');
        }
    }
    let prefix = prefix.trim_end_matches('-');
    if prefix.is_empty() {
        "run".to_string()
    } else {
        prefix.to_string()
    }
}

fn to_base36(mut n: u64, width: usize) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    while out.len() < width {
        out.push(b'0');
    }
    out.reverse();
    String::from_utf8_lossy(&out).to_string()
}

const SUMMARY_MAX_DEPTH: usize = 4;
const SUMMARY_MAX_STRING: usize = 256;
const SUMMARY_MAX_ITEMS: usize = 32;

/// Trim a serialized context down to something worth keeping in an audit record.
pub fn summarize(value: &serde_json::Value) -> serde_json::Value {
    summarize_at(value, 0)
}

fn summarize_at(value: &serde_json::Value, depth: usize) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::String(s) if s.chars().count() > SUMMARY_MAX_STRING => {
            let mut cut: String = s.chars().take(SUMMARY_MAX_STRING).collect();
            cut.push('…');
            Value::String(cut)
        }
        Value::Array(_) | Value::Object(_) if depth >= SUMMARY_MAX_DEPTH => Value::Null,
        Value::Array(items) => Value::Array(
            items
                .iter()
                .take(SUMMARY_MAX_ITEMS)
                .map(|item| summarize_at(item, depth + 1))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), summarize_at(v, depth + 1)))
                .collect(),
        ),
        other => other.clone(),
    }
}
