//! Wires the `ReverseProxy` into the `/programs/{id}/proxy/*` routes:
//! gates on `state == Ready`, then forwards HTTP or splices a WebSocket
//! upgrade to the program's Watcher API.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::proxy;
use crate::registry::ProgramState;

use super::super::AppState;

fn not_ready_response(state: ProgramState) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "program not ready", "state": state.as_str() })),
    )
        .into_response()
}

fn not_found_response() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown program" }))).into_response()
}

async fn dispatch(
    appstate: AppState,
    program_id: String,
    rest: String,
    ws: Option<WebSocketUpgrade>,
    method: Method,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Response {
    let record = match appstate.engine.get(&program_id) {
        Some(record) => record,
        None => return not_found_response(),
    };

    if record.state != ProgramState::Ready {
        return not_ready_response(record.state);
    }

    let host_port = match record.host_port {
        Some(port) => port,
        None => return not_ready_response(record.state),
    };

    if let Some(ws) = ws {
        return ws.on_upgrade(move |socket| async move {
            proxy::splice_websocket(socket, host_port, &rest).await;
        });
    }

    proxy::forward_http(&appstate.http, host_port, &rest, method, headers, body).await
}

pub async fn proxy_request(
    State(state): State<AppState>,
    Path((program_id, rest)): Path<(String, String)>,
    ws: Option<WebSocketUpgrade>,
    method: Method,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Response {
    dispatch(state, program_id, rest, ws, method, headers, body).await
}

pub async fn proxy_root(
    State(state): State<AppState>,
    Path(program_id): Path<String>,
    ws: Option<WebSocketUpgrade>,
    method: Method,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Response {
    dispatch(state, program_id, String::new(), ws, method, headers, body).await
}
