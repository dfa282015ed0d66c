use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::ApiState;
use crate::error::WatcherError;

#[derive(Serialize)]
pub struct StatusResponse {
    state: &'static str,
    uptime_ms: u128,
    queue_depth: usize,
    messages_processed: u64,
    handler_errors: u64,
}

pub async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let status = state.view.status();
    Json(StatusResponse {
        state: status.state.as_str(),
        uptime_ms: status.uptime_ms,
        queue_depth: status.queue_depth,
        messages_processed: status.messages_processed,
        handler_errors: status.handler_errors,
    })
}

pub async fn values(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.view.snapshot()).unwrap_or(serde_json::Value::Null))
}

pub async fn value_by_key(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.view.get_value_json(&key) {
        Ok(value) => Json(value).into_response(),
        Err(err @ WatcherError::KeyNotFound(_)) => err.into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Deserialize)]
pub struct MessageRequest {
    content: String,
}

#[derive(Serialize)]
pub struct MessageResponse {
    accepted: bool,
    queue_depth: usize,
}

pub async fn post_message(
    State(state): State<ApiState>,
    Json(req): Json<MessageRequest>,
) -> Json<MessageResponse> {
    let accepted = state.view.enqueue(req.content).await;
    let queue_depth = state.view.status().queue_depth;
    Json(MessageResponse { accepted, queue_depth })
}

pub async fn post_shutdown(State(state): State<ApiState>) -> StatusCode {
    let view: Arc<dyn super::WatcherView> = state.view;
    view.trigger_shutdown().await;
    StatusCode::ACCEPTED
}
