//! `ContainerSupervisor`: the seam between the lifecycle engine and
//! whatever container engine actually runs a program.
//!
//! Defined as a trait so the lifecycle engine's tests can run against an
//! in-memory fake instead of a real Docker daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("docker engine error: {0}")]
    Engine(#[from] bollard::errors::Error),

    #[error("container not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Default)]
pub struct Inspection {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Everything the lifecycle engine needs from a container runtime.
/// Implementations must be safe to call concurrently across distinct
/// containers; the engine never calls two operations for the same
/// `container_id` concurrently (that's serialized by the per-program
/// worker).
#[async_trait]
pub trait ContainerSupervisor: Send + Sync {
    /// Creates a container from `image_tag`, mapping its fixed internal
    /// Watcher port (8080) to `host_port`, with `env` applied and a
    /// bind-mounted `/state` directory unique to the program. Restart
    /// policy is always "none" — the lifecycle engine, not the container
    /// runtime, decides whether a program restarts.
    async fn create(
        &self,
        program_id: &str,
        image_tag: &str,
        host_port: u16,
        env: &HashMap<String, String>,
        state_dir: &std::path::Path,
    ) -> Result<String, SupervisorError>;

    async fn start(&self, container_id: &str) -> Result<(), SupervisorError>;

    /// Sends a graceful stop signal, force-killing after `grace` elapses.
    async fn stop(&self, container_id: &str, grace: std::time::Duration) -> Result<(), SupervisorError>;

    /// Removes the container. A no-op (not an error) if it's already gone.
    async fn remove(&self, container_id: &str) -> Result<(), SupervisorError>;

    async fn inspect(&self, container_id: &str) -> Result<Inspection, SupervisorError>;
}
