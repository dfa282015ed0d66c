//! Top-level error type for the control-plane API, translating error kinds
//! to the wire format and status codes of the control-plane API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown program: {0}")]
    NotFound(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),
}

impl HostError {
    fn kind(&self) -> &'static str {
        match self {
            HostError::Validation(_) => "validation_error",
            HostError::NotFound(_) => "not_found",
            HostError::IllegalTransition(_) => "illegal_transition",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            HostError::Validation(_) => StatusCode::BAD_REQUEST,
            HostError::NotFound(_) => StatusCode::NOT_FOUND,
            HostError::IllegalTransition(_) => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for HostError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
