//! Error types for the Watcher runtime and its introspection API.

use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watcher is already running")]
    AlreadyRunning,

    #[error("Watcher is not running")]
    NotRunning,

    #[error("handler '{0}' timed out")]
    HandlerTimeout(String),

    #[error("handler '{0}' failed: {1}")]
    HandlerFailed(String, String),

    #[error("handler '{0}' panicked")]
    HandlerPanicked(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type WatcherResult<T> = Result<T, WatcherError>;

impl IntoResponse for WatcherError {
    fn into_response(self) -> Response {
        let status = match &self {
            WatcherError::AlreadyRunning | WatcherError::NotRunning => StatusCode::CONFLICT,
            WatcherError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
