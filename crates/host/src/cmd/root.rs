//! Main daemon command - starts the control-plane server and drives every
//! program's worker task.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bollard::Docker;
use tracing::{error, info, warn};

use program_host::build::DockerImageBuilder;
use program_host::config::Configuration;
use program_host::lifecycle::LifecycleEngine;
use program_host::ports::PortAllocator;
use program_host::registry::ProgramRegistry;
use program_host::router::{self, AppState};
use program_host::supervisor::DockerSupervisor;

pub async fn run(config_path: &str) -> Result<()> {
    info!("Loading configuration from: {}", config_path);
    let config = Configuration::load(config_path).context("loading configuration")?;
    let config = Arc::new(config);

    info!("  listen_addr: {}", config.listen_addr);
    info!("  storage_dir: {}", config.storage_dir.display());
    info!("  port_range: {}-{}", config.port_range.start, config.port_range.end);

    let docker = Docker::connect_with_socket(&config.docker.socket, 120, bollard::API_DEFAULT_VERSION)
        .context("connecting to the container engine")?;

    let registry = Arc::new(
        ProgramRegistry::open(&config.storage_dir).context("replaying program registry")?,
    );
    let ports = Arc::new(PortAllocator::new(config.port_range));
    let builder = Arc::new(DockerImageBuilder::new(docker.clone(), config.storage_dir.join("workspaces")));
    let supervisor = Arc::new(DockerSupervisor::new(docker, &config.docker));

    let engine = LifecycleEngine::new(registry, ports, builder, supervisor, config.clone());

    let http = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30))
        .build()
        .context("building the reverse-proxy HTTP client")?;

    let state = AppState { engine: engine.clone(), config: config.clone(), http };
    let app = router::build_router(state);

    let bind_addr = resolve_listen_addr(&config.listen_addr)?;

    let shutdown_engine = engine.clone();
    let shutdown_deadline = config.shutdown_deadline;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install CTRL+C handler: {}", e);
            return;
        }
        warn!("received shutdown signal, draining programs...");
        shutdown_engine.shutdown_all(shutdown_deadline).await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
    });

    info!("Starting control-plane HTTP server on {}", bind_addr);
    axum_server::bind(bind_addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    info!("Daemon stopped");
    Ok(())
}

/// `listen_addr` follows the Go-style `":9000"` convention (bind on every
/// interface) as well as explicit `host:port` forms; `SocketAddr` only
/// parses the latter, so a bare `:port` is expanded to `0.0.0.0:port`.
fn resolve_listen_addr(listen_addr: &str) -> Result<SocketAddr> {
    let normalized = if let Some(port) = listen_addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        listen_addr.to_string()
    };
    normalized.parse().with_context(|| format!("invalid listen_addr '{listen_addr}'"))
}
