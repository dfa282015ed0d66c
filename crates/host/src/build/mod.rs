//! `ImageBuilder`: turns a submitted source bundle into a container
//! image.

mod docker;
#[cfg(test)]
mod fake;

pub use docker::DockerImageBuilder;
#[cfg(test)]
pub use fake::FakeImageBuilder;

use async_trait::async_trait;
use thiserror::Error;

use crate::registry::{BoundedLog, ProgramId};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build failed: {reason}")]
    Failed { reason: String, log: BoundedLog },

    #[error("workspace error: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("docker engine error: {0}")]
    Engine(#[from] bollard::errors::Error),
}

impl BuildError {
    pub fn reason(&self) -> String {
        match self {
            BuildError::Failed { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }

    pub fn log(&self) -> BoundedLog {
        match self {
            BuildError::Failed { log, .. } => log.clone(),
            _ => BoundedLog::default(),
        }
    }
}

/// A deterministic-tag image build, producing either a tag plus the full
/// build log, or a `BuildError::Failed` carrying the log captured so far.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(
        &self,
        program_id: &ProgramId,
        user_id: &str,
        source_files: &std::collections::HashMap<String, String>,
        dockerfile: &str,
    ) -> Result<(String, BoundedLog), BuildError>;
}
