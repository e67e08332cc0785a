use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Crate-wide error type. Each variant carries a stable `code()` and maps to
/// a fixed HTTP status; see spec §7 "Error Handling Design".
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid config or request: {0}")]
    InvalidConfig(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("stream already exists: {0}")]
    StreamAlreadyExists(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("store busy, retry later")]
    StoreRetryable,

    #[error("internal store error: {0}")]
    StoreInternal(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable code, independent of the human message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidConfig(_) => "invalid_config",
            AppError::StreamNotFound(_) => "stream_not_found",
            AppError::NotFound(_) => "not_found",
            AppError::StreamAlreadyExists(_) => "stream_already_exists",
            AppError::ResourceExhausted(_) => "resource_exhausted",
            AppError::ConnectionFailed(_) => "connection_failed",
            AppError::Timeout => "timeout",
            AppError::Cancelled => "cancelled",
            AppError::StoreRetryable => "store_retryable",
            AppError::StoreInternal(_) => "store_internal",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            AppError::StreamNotFound(_) => StatusCode::NOT_FOUND,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::StreamAlreadyExists(_) => StatusCode::CONFLICT,
            AppError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ConnectionFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::StoreRetryable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::StoreInternal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            AppError::Internal(e) => tracing::error!("internal error: {e:#}"),
            AppError::StoreInternal(msg) => tracing::error!("store error: {msg}"),
            AppError::ConnectionFailed(msg) => tracing::warn!("connection failed: {msg}"),
            _ => {}
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => AppError::StoreRetryable,
            sqlx::Error::Database(db_err) => {
                // SQLite busy/locked surfaces as a generic Database error with
                // these codes; anything else is a non-retryable internal fault.
                let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
                if code == "5" || code == "6" {
                    // SQLITE_BUSY / SQLITE_LOCKED
                    AppError::StoreRetryable
                } else {
                    AppError::StoreInternal(err.to_string())
                }
            }
            _ => AppError::StoreInternal(err.to_string()),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::ConnectionFailed(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
