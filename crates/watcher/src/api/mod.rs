//! The Watcher's in-program HTTP introspection API.
//!
//! The runtime owns the server handle; the API reads the runtime through
//! [`WatcherView`], a narrow capability interface, rather than holding a
//! second `Arc<Watcher>` with full access — this breaks the cyclic
//! ownership the runtime and the API would otherwise have on each other.

mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::WatcherResult;
use crate::runtime::WatcherStatus;

/// The capability surface the HTTP handlers are allowed to use. Implemented
/// by `Watcher` itself; kept separate so the API module never needs the
/// dispatcher or handler registry.
#[async_trait::async_trait]
pub trait WatcherView: Send + Sync + 'static {
    fn status(&self) -> WatcherStatus;
    fn snapshot(&self) -> std::collections::HashMap<String, serde_json::Value>;
    fn get_value_json(&self, key: &str) -> WatcherResult<serde_json::Value>;
    async fn enqueue(&self, content: String) -> bool;
    async fn trigger_shutdown(self: Arc<Self>);
}

#[async_trait::async_trait]
impl WatcherView for crate::runtime::Watcher {
    fn status(&self) -> WatcherStatus {
        crate::runtime::Watcher::status(self)
    }

    fn snapshot(&self) -> std::collections::HashMap<String, serde_json::Value> {
        self.context().snapshot()
    }

    fn get_value_json(&self, key: &str) -> WatcherResult<serde_json::Value> {
        self.get_value(key).map(|v| v.to_json())
    }

    async fn enqueue(&self, content: String) -> bool {
        self.send_message(content).await
    }

    async fn trigger_shutdown(self: Arc<Self>) {
        // Stop() is spawned rather than awaited inline so the HTTP response
        // for POST /watcher/shutdown can return 202 immediately.
        tokio::spawn(async move { self.stop().await });
    }
}

#[derive(Clone)]
struct ApiState {
    view: Arc<dyn WatcherView>,
}

fn router(view: Arc<dyn WatcherView>) -> Router {
    Router::new()
        .route("/watcher/status", get(handlers::status))
        .route("/watcher/values", get(handlers::values))
        .route("/watcher/values/:key", get(handlers::value_by_key))
        .route("/watcher/message", post(handlers::post_message))
        .route("/watcher/shutdown", post(handlers::post_shutdown))
        .with_state(ApiState { view })
}

/// A handle to the bound HTTP server, returned by `Watcher::start_api_server`.
pub struct ApiServerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl ApiServerHandle {
    /// Requests graceful shutdown, waiting up to `deadline` for in-flight
    /// requests to finish before returning regardless of outcome.
    pub async fn shutdown(mut self, deadline: std::time::Duration) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(deadline, self.join).await;
    }
}

/// Binds the introspection API on `view`'s configured `server_port`.
pub async fn start_api_server(
    view: Arc<dyn WatcherView>,
    port: u16,
) -> std::io::Result<ApiServerHandle> {
    let app = router(view);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    info!(port, "watcher API listening");
    let join = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    Ok(ApiServerHandle { shutdown_tx: Some(shutdown_tx), join })
}
