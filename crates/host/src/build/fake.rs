//! In-memory `ImageBuilder` used by lifecycle-engine tests, standing in
//! for a Docker daemon the test environment doesn't have.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::registry::{BoundedLog, ProgramId};

use super::{BuildError, ImageBuilder};

#[derive(Default)]
pub struct FakeImageBuilder {
    fail: AtomicBool,
    delay: std::sync::Mutex<Option<Duration>>,
}

impl FakeImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `build` call fails with `BuildError::Failed`.
    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// The next `build` call sleeps `delay` before resolving, to exercise
    /// `build_timeout`.
    pub fn delay_next(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl ImageBuilder for FakeImageBuilder {
    async fn build(
        &self,
        program_id: &ProgramId,
        _user_id: &str,
        _source_files: &HashMap<String, String>,
        _dockerfile: &str,
    ) -> Result<(String, BoundedLog), BuildError> {
        if let Some(delay) = self.delay.lock().unwrap().take() {
            tokio::time::sleep(delay).await;
        }

        if self.fail.swap(false, Ordering::SeqCst) {
            let mut log = BoundedLog::default();
            log.push_line("build step failed");
            return Err(BuildError::Failed { reason: "fake build failure".into(), log });
        }

        Ok((format!("fake/{program_id}:latest"), BoundedLog::default()))
    }
}
