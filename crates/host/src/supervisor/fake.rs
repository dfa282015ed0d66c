//! In-memory `ContainerSupervisor` used by lifecycle-engine tests, standing
//! in for a Docker daemon the test environment doesn't have.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{ContainerSupervisor, Inspection, SupervisorError};

#[derive(Default)]
pub struct FakeContainerSupervisor {
    next_id: AtomicU64,
    fail_create: AtomicBool,
    created: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl FakeContainerSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn created_ids(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    pub fn removed_ids(&self) -> Vec<String> {
        self.removed.lock().clone()
    }
}

#[async_trait]
impl ContainerSupervisor for FakeContainerSupervisor {
    async fn create(
        &self,
        program_id: &str,
        _image_tag: &str,
        _host_port: u16,
        _env: &HashMap<String, String>,
        _state_dir: &std::path::Path,
    ) -> Result<String, SupervisorError> {
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(SupervisorError::NotFound(program_id.to_string()));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.created.lock().push(id.clone());
        Ok(id)
    }

    async fn start(&self, _container_id: &str) -> Result<(), SupervisorError> {
        Ok(())
    }

    async fn stop(&self, _container_id: &str, _grace: std::time::Duration) -> Result<(), SupervisorError> {
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), SupervisorError> {
        self.removed.lock().push(container_id.to_string());
        Ok(())
    }

    async fn inspect(&self, _container_id: &str) -> Result<Inspection, SupervisorError> {
        Ok(Inspection { running: true, exit_code: None })
    }
}
