//! Docker-backed `ImageBuilder`: tar the submitted bundle into a build
//! context and stream it through `bollard::Docker::build_image`.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::image::BuildImageOptions;
use bollard::Docker;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tar::Builder as TarBuilder;
use tracing::{debug, warn};

use crate::registry::{BoundedLog, ProgramId};

use super::{BuildError, ImageBuilder};

const DOCKERFILE_NAME: &str = "Dockerfile";

pub struct DockerImageBuilder {
    client: Docker,
    workspace_root: PathBuf,
}

impl DockerImageBuilder {
    pub fn new(client: Docker, workspace_root: PathBuf) -> Self {
        Self { client, workspace_root }
    }

    /// Writes the submitted files to
    /// `<workspace_root>/<user_id>-build-<short-image-hash>-<short-id>/src/`,
    /// guaranteeing the whole `<user_id>-build-...` directory is removed
    /// regardless of build outcome. Returns `(root, src)`.
    fn stage_workspace(
        &self,
        program_id: &ProgramId,
        user_id: &str,
        image_hash: &str,
        source_files: &HashMap<String, String>,
    ) -> Result<(PathBuf, PathBuf), BuildError> {
        let short_id = &program_id[..program_id.len().min(8)];
        let root = self.workspace_root.join(format!("{user_id}-build-{image_hash}-{short_id}"));
        let src = root.join("src");
        std::fs::create_dir_all(&src).map_err(BuildError::Workspace)?;

        for (name, content) in source_files {
            let path = src.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(BuildError::Workspace)?;
            }
            std::fs::write(&path, content).map_err(BuildError::Workspace)?;
        }

        Ok((root, src))
    }

    fn build_context_tar(dir: &Path) -> Result<Vec<u8>, BuildError> {
        let mut tar_data = Vec::new();
        {
            let cursor = Cursor::new(&mut tar_data);
            let mut builder = TarBuilder::new(cursor);
            builder.append_dir_all(".", dir).map_err(BuildError::Workspace)?;
            builder.finish().map_err(BuildError::Workspace)?;
        }
        Ok(tar_data)
    }

    /// A hash deterministic in the submitted content (source files plus
    /// effective Dockerfile), used both as the workspace directory's
    /// short-image-hash component and as the image tag, so an unchanged
    /// resubmission reproduces the same tag without a separate tag store.
    fn content_hash(source_files: &HashMap<String, String>, dockerfile: &str) -> String {
        let mut names: Vec<&String> = source_files.keys().collect();
        names.sort();

        let mut hasher = Sha256::new();
        for name in names {
            hasher.update(name.as_bytes());
            hasher.update(source_files[name].as_bytes());
        }
        hasher.update(dockerfile.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..4])
    }

    fn deterministic_tag(program_id: &ProgramId, image_hash: &str) -> String {
        format!("program-host/{program_id}:{image_hash}")
    }
}

#[async_trait]
impl ImageBuilder for DockerImageBuilder {
    async fn build(
        &self,
        program_id: &ProgramId,
        user_id: &str,
        source_files: &HashMap<String, String>,
        dockerfile: &str,
    ) -> Result<(String, BoundedLog), BuildError> {
        let image_hash = Self::content_hash(source_files, dockerfile);
        let (root, src) = self.stage_workspace(program_id, user_id, &image_hash, source_files)?;

        // The Dockerfile may arrive either as its own entry or embedded in
        // `source_files` under the conventional name; write it out
        // explicitly so the build context always has one at the root.
        let dockerfile_path = src.join(DOCKERFILE_NAME);
        if !dockerfile_path.exists() {
            if let Err(err) = std::fs::write(&dockerfile_path, dockerfile) {
                let _ = std::fs::remove_dir_all(&root);
                return Err(BuildError::Workspace(err));
            }
        }

        let result = self.run_build(program_id, &image_hash, &src).await;
        let _ = std::fs::remove_dir_all(&root);
        result
    }
}

impl DockerImageBuilder {
    async fn run_build(
        &self,
        program_id: &ProgramId,
        image_hash: &str,
        workspace: &Path,
    ) -> Result<(String, BoundedLog), BuildError> {
        let tar_data = Self::build_context_tar(workspace)?;
        let tag = Self::deterministic_tag(program_id, image_hash);

        let options = BuildImageOptions {
            dockerfile: DOCKERFILE_NAME.to_string(),
            t: tag.clone(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self.client.build_image(options, None, Some(tar_data.into()));
        let mut log = BoundedLog::default();

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => {
                    if let Some(line) = output.stream {
                        log.push_line(line.trim_end());
                        debug!(program_id = %program_id, "{}", line.trim_end());
                    }
                    if let Some(error) = output.error {
                        log.push_line(format!("error: {error}"));
                        warn!(program_id = %program_id, error = %error, "build failed");
                        return Err(BuildError::Failed { reason: error, log });
                    }
                }
                Err(err) => {
                    log.push_line(format!("error: {err}"));
                    return Err(BuildError::Failed { reason: err.to_string(), log });
                }
            }
        }

        Ok((tag, log))
    }
}
