//! `ReverseProxy`: passthrough HTTP and WebSocket traffic to a Ready
//! program's Watcher API.

use axum::body::Body;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tracing::warn;

/// Headers that must not be forwarded verbatim across the proxy boundary.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

/// Forwards a single HTTP request to `http://127.0.0.1:{host_port}/{rest}`,
/// preserving method, headers (minus hop-by-hop), and body, and streams
/// the response back without fully buffering it.
pub async fn forward_http(
    client: &reqwest::Client,
    host_port: u16,
    rest: &str,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let url = format!("http://127.0.0.1:{host_port}/{rest}");

    let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let mut builder = client.request(reqwest_method, &url);
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let upstream = match builder.send().await {
        Ok(resp) => resp,
        Err(err) => {
            warn!(host_port, error = %err, "proxy request to program failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers().iter() {
        if let Ok(name) = HeaderName::from_bytes(name.as_str().as_bytes()) {
            if is_hop_by_hop(&name) {
                continue;
            }
            response_headers.insert(name, value.clone().try_into().unwrap_or_else(|_| "".parse().unwrap()));
        }
    }

    let stream = upstream.bytes_stream();
    let mut response = Response::builder().status(status.as_u16());
    if let Some(h) = response.headers_mut() {
        *h = response_headers;
    }

    response
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Splices an already-upgraded client WebSocket to
/// `ws://127.0.0.1:{host_port}/{rest}`, byte-for-byte, until either side
/// closes.
pub async fn splice_websocket(client_socket: WebSocket, host_port: u16, rest: &str) {
    let url = format!("ws://127.0.0.1:{host_port}/{rest}");

    let (upstream, _) = match tokio_tungstenite::connect_async(&url).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(host_port, error = %err, "failed to connect upstream websocket");
            return;
        }
    };

    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = client_socket.split();

    loop {
        tokio::select! {
            msg = client_rx.next() => {
                match msg {
                    Some(Ok(AxumMessage::Text(text))) => {
                        if upstream_tx.send(TungsteniteMessage::Text(text.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(AxumMessage::Binary(data))) => {
                        if upstream_tx.send(TungsteniteMessage::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(AxumMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by axum
                    Some(Err(_)) => break,
                }
            }
            msg = upstream_rx.next() => {
                match msg {
                    Some(Ok(TungsteniteMessage::Text(text))) => {
                        if client_tx.send(AxumMessage::Text(text.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(TungsteniteMessage::Binary(data))) => {
                        if client_tx.send(AxumMessage::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(TungsteniteMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
