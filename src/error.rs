// src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures reported by a [`crate::store::PollStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached. Retrying the same call may succeed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                StoreError::Conflict(db_err.message().to_string())
            }
            sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
                StoreError::NotFound(db_err.message().to_string())
            }
            other => StoreError::Internal(other.to_string()),
        }
    }
}

/// Errors surfaced by the HTTP layer. Every variant is scoped to the request
/// that produced it.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Store unavailable, please retry")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => AppError::Unavailable(msg),
            StoreError::NotFound(msg) => AppError::NotFound(msg),
            StoreError::Conflict(msg) | StoreError::Internal(msg) => AppError::Internal(msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, retryable) = match &self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, false),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, false),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, false),
            AppError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, true),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, false),
        };

        if status.is_server_error() {
            tracing::error!(error = ?self, "Request failed");
        }

        let body = if retryable {
            json!({ "error": self.to_string(), "retryable": true })
        } else {
            json!({ "error": self.to_string() })
        };

        (status, Json(body)).into_response()
    }
}
