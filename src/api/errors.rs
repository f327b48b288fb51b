use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::storage::TraceStoreError;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Handler failure mapped onto an HTTP status.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            AppError::BadRequest(error) | AppError::NotFound(error) => ErrorResponse {
                error,
                details: None,
            },
            AppError::Internal(err) => ErrorResponse {
                error: "Internal server error".to_string(),
                details: Some(format!("{:#}", err)),
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<TraceStoreError> for AppError {
    fn from(err: TraceStoreError) -> Self {
        match err {
            TraceStoreError::MalformedId(id) => {
                AppError::BadRequest(format!("Malformed trace id '{}'", id))
            }
            other => AppError::Internal(other.into()),
        }
    }
}
