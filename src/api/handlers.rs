use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::atomic::writable_hint;
use crate::storage::pointer::load_pointer;
use crate::storage::{TraceFilter, TraceRecord, TraceStore as _};

use super::AppState;
use super::errors::AppError;

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;

// --- Request/Response types ---

#[derive(Deserialize)]
pub struct ListTracesQuery {
    /// Specification name prefix.
    pub skill: Option<String>,
    pub limit: Option<usize>,
}

/// One row of `GET /traces`; the full event log is only served per trace.
#[derive(Serialize)]
pub struct TraceSummary {
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
}

impl From<TraceRecord> for TraceSummary {
    fn from(r: TraceRecord) -> Self {
        Self {
            trace_id: r.trace_id,
            skill: r.skill,
            version: r.version,
            ok: r.ok,
            start_state: r.start_state,
            end_state: r.end_state,
            steps: r.steps,
            ts: r.ts,
        }
    }
}

#[derive(Serialize)]
pub struct ListTracesResponse {
    pub traces: Vec<TraceSummary>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct StorageHealthResponse {
    pub writable: bool,
    pub pointer_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_commit_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_commit_age_secs: Option<i64>,
}

// --- Handlers ---

/// GET /traces
pub async fn list_traces(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTracesQuery>,
) -> Result<Json<ListTracesResponse>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if !(1..=MAX_LIST_LIMIT).contains(&limit) {
        return Err(AppError::BadRequest(format!(
            "limit must be between 1 and {}, got {}",
            MAX_LIST_LIMIT, limit
        )));
    }

    let records = state
        .store
        .list(&TraceFilter {
            skill_prefix: query.skill,
            limit,
        })
        .await?;

    let traces: Vec<TraceSummary> = records.into_iter().map(TraceSummary::from).collect();
    let total = traces.len();
    Ok(Json(ListTracesResponse { traces, total }))
}

/// GET /traces/{id}
pub async fn get_trace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TraceRecord>, AppError> {
    match state.store.get(&id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(AppError::NotFound(format!("Trace '{}' not found", id))),
    }
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /health/storage
pub async fn storage_health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StorageHealthResponse>, AppError> {
    let writable = writable_hint(&state.data_dir).await;
    let pointer = load_pointer(&state.pointer_path).await?;
    let now = Utc::now();

    Ok(Json(StorageHealthResponse {
        writable,
        pointer_present: pointer.is_some(),
        last_commit_at: pointer.as_ref().map(|p| p.updated_at),
        last_commit_age_secs: pointer.as_ref().map(|p| p.age_secs(now)),
    }))
}
