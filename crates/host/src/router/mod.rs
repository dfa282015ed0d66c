//! HTTP router module: the control-plane API.

mod handlers;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Configuration;
use crate::lifecycle::LifecycleEngine;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LifecycleEngine>,
    pub config: Arc<Configuration>,
    pub http: reqwest::Client,
}

/// Builds the full HTTP router: the `/programs` collection, individual
/// program routes, and the catch-all reverse proxy.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/programs", get(handlers::programs::list_programs))
        .route("/programs", post(handlers::programs::create_program))
        .nest("/programs/:program_id", program_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

fn program_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::programs::get_program))
        .route("/", delete(handlers::programs::delete_program))
        .route("/start", post(handlers::programs::start_program))
        .route("/stop", post(handlers::programs::stop_program))
        .route(
            "/proxy/",
            axum::routing::any(handlers::proxy::proxy_root),
        )
        .route(
            "/proxy/*rest",
            axum::routing::any(handlers::proxy::proxy_request),
        )
}
