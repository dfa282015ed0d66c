//! `LifecycleEngine`: the public seam the router calls into. Owns the
//! per-program worker tasks and their command channels.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::build::ImageBuilder;
use crate::config::Configuration;
use crate::error::{HostError, Result};
use crate::ports::PortAllocator;
use crate::registry::{ProgramId, ProgramRecord, ProgramRegistry, ProgramState};
use crate::supervisor::ContainerSupervisor;

use super::worker::{self, WorkerContext};

#[derive(Debug, Clone, Copy)]
pub enum LifecycleCommand {
    Start,
    Stop,
    Shutdown,
}

pub struct LifecycleEngine {
    registry: Arc<ProgramRegistry>,
    ports: Arc<PortAllocator>,
    builder: Arc<dyn ImageBuilder>,
    supervisor: Arc<dyn ContainerSupervisor>,
    config: Arc<Configuration>,
    http: reqwest::Client,
    channels: DashMap<ProgramId, mpsc::Sender<LifecycleCommand>>,
    root_cancellation: CancellationToken,
}

impl LifecycleEngine {
    pub fn new(
        registry: Arc<ProgramRegistry>,
        ports: Arc<PortAllocator>,
        builder: Arc<dyn ImageBuilder>,
        supervisor: Arc<dyn ContainerSupervisor>,
        config: Arc<Configuration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            ports,
            builder,
            supervisor,
            config,
            http: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            channels: DashMap::new(),
            root_cancellation: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<ProgramRegistry> {
        &self.registry
    }

    /// Validates and registers a new program, then spawns its worker task.
    /// The worker immediately picks it up (`Pending -> Building`).
    pub fn submit(
        self: &Arc<Self>,
        user_id: String,
        dockerfile: String,
        mut src_files: HashMap<String, String>,
    ) -> Result<ProgramId> {
        if user_id.trim().is_empty() {
            return Err(HostError::Validation("user_id must not be empty".into()));
        }
        if src_files.is_empty() {
            return Err(HostError::Validation("src_files must not be empty".into()));
        }
        if dockerfile.trim().is_empty() && !src_files.contains_key("Dockerfile") {
            return Err(HostError::Validation("dockerfile must not be empty".into()));
        }
        if !src_files.contains_key("Dockerfile") && !dockerfile.trim().is_empty() {
            src_files.insert("Dockerfile".to_string(), dockerfile);
        }

        let program_id = Uuid::new_v4().to_string();
        let record = ProgramRecord::new(program_id.clone(), user_id, src_files);
        self.registry.put(record);

        let (tx, rx) = mpsc::channel(4);
        self.channels.insert(program_id.clone(), tx);

        let ctx = WorkerContext {
            program_id: program_id.clone(),
            registry: self.registry.clone(),
            ports: self.ports.clone(),
            builder: self.builder.clone(),
            supervisor: self.supervisor.clone(),
            config: self.config.clone(),
            http: self.http.clone(),
            cancellation: self.root_cancellation.child_token(),
        };

        tokio::spawn(worker::run(ctx, rx));
        info!(program_id = %program_id, "program submitted");
        Ok(program_id)
    }

    pub fn get(&self, id: &str) -> Option<ProgramRecord> {
        self.registry.get(id).map(|r| r.read().clone())
    }

    pub fn list(&self) -> Vec<ProgramRecord> {
        self.registry.list(|_| true)
    }

    /// Idempotent: a no-op returning the current record if already
    /// Starting/Ready. 409 if the record isn't in a state `/start` applies
    /// to (anything other than Created, Starting, Ready).
    pub async fn start(&self, id: &str) -> Result<ProgramRecord> {
        let record = self.registry.get(id).ok_or_else(|| HostError::NotFound(id.to_string()))?;

        let snapshot = {
            let mut guard = record.write();
            match guard.state {
                ProgramState::Starting | ProgramState::Ready => return Ok(guard.clone()),
                ProgramState::Created => {
                    guard.transition(ProgramState::Starting, None);
                    guard.clone()
                }
                _ => {
                    return Err(HostError::IllegalTransition(format!(
                        "cannot start a program in state {}",
                        guard.state.as_str()
                    )))
                }
            }
        };

        if let Some(tx) = self.channels.get(id) {
            let _ = tx.send(LifecycleCommand::Start).await;
        }

        Ok(snapshot)
    }

    /// Idempotent: a no-op returning the current record if already
    /// terminal. Otherwise signals the worker to tear the program down;
    /// only a Ready program takes the graceful Stopping path, everything
    /// else is aborted straight to Error (the state graph has no edge
    /// into Stopping except from Ready).
    pub async fn stop(&self, id: &str) -> Result<ProgramRecord> {
        let record = self.registry.get(id).ok_or_else(|| HostError::NotFound(id.to_string()))?;

        let snapshot = {
            let mut guard = record.write();
            if guard.state.is_terminal() {
                return Ok(guard.clone());
            }
            if guard.state == ProgramState::Ready {
                guard.transition(ProgramState::Stopping, None);
            }
            guard.clone()
        };

        if let Some(tx) = self.channels.get(id) {
            let _ = tx.send(LifecycleCommand::Stop).await;
        }

        Ok(snapshot)
    }

    /// Only permitted in a terminal state; 409 otherwise.
    pub fn delete(&self, id: &str) -> Result<()> {
        let record = self.registry.get(id).ok_or_else(|| HostError::NotFound(id.to_string()))?;
        let terminal = record.read().state.is_terminal();
        if !terminal {
            return Err(HostError::IllegalTransition(
                "cannot delete a program outside a terminal state".into(),
            ));
        }
        self.channels.remove(id);
        self.registry.delete(id);
        Ok(())
    }

    /// Stops accepting new programs implicitly (callers should stop
    /// calling `submit`) and drives every non-terminal program through
    /// Stopping/Error within `deadline`.
    pub async fn shutdown_all(&self, deadline: std::time::Duration) {
        self.root_cancellation.cancel();
        let _ = tokio::time::timeout(deadline, async {
            loop {
                let pending = self.registry.list(|r| !r.state.is_terminal()).len();
                if pending == 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::build::FakeImageBuilder;
    use crate::config::{Configuration, DockerConfiguration, PortRangeConfig};
    use crate::supervisor::FakeContainerSupervisor;

    use super::*;

    fn test_config(storage_dir: std::path::PathBuf, port_range: PortRangeConfig) -> Arc<Configuration> {
        Arc::new(Configuration {
            debug: false,
            listen_addr: "127.0.0.1:0".to_string(),
            storage_dir,
            port_range,
            build_timeout: Duration::from_secs(5),
            start_timeout: Duration::from_secs(3),
            shutdown_deadline: Duration::from_secs(5),
            docker: DockerConfiguration::default(),
        })
    }

    fn test_engine(port_range: PortRangeConfig) -> (Arc<LifecycleEngine>, Arc<FakeContainerSupervisor>, tempfile::TempDir) {
        test_engine_with_builder(port_range, FakeImageBuilder::new())
    }

    fn test_engine_with_builder(
        port_range: PortRangeConfig,
        builder: FakeImageBuilder,
    ) -> (Arc<LifecycleEngine>, Arc<FakeContainerSupervisor>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ProgramRegistry::open(dir.path()).unwrap());
        let ports = Arc::new(PortAllocator::new(port_range));
        let supervisor = Arc::new(FakeContainerSupervisor::new());
        let config = test_config(dir.path().to_path_buf(), port_range);
        let engine = LifecycleEngine::new(registry, ports, Arc::new(builder), supervisor.clone(), config);
        (engine, supervisor, dir)
    }

    async fn wait_until(
        engine: &LifecycleEngine,
        id: &str,
        target: ProgramState,
        timeout: Duration,
    ) -> ProgramRecord {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = engine.get(id) {
                if record.state == target || record.state.is_terminal() {
                    return record;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for state {target:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn trivial_submission() -> (String, String, HashMap<String, String>) {
        let mut files = HashMap::new();
        files.insert("Dockerfile".to_string(), "FROM scratch".to_string());
        ("user-1".to_string(), String::new(), files)
    }

    /// Spawns a bare-bones HTTP server answering 200 on `/watcher/status`,
    /// standing in for a program's embedded Watcher API so a worker's
    /// readiness poll can actually succeed.
    async fn spawn_fake_watcher(port: u16) {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let app = axum::Router::new().route("/watcher/status", axum::routing::get(|| async {}));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        // give the listener a moment to actually accept before the worker polls it
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn submit_walks_to_created_with_no_back_edges() {
        let (engine, _supervisor, _dir) = test_engine(PortRangeConfig { start: 29100, end: 29101 });
        let (user_id, dockerfile, files) = trivial_submission();
        let id = engine.submit(user_id, dockerfile, files).unwrap();

        let record = wait_until(&engine, &id, ProgramState::Created, Duration::from_secs(2)).await;
        assert_eq!(record.state, ProgramState::Created);
        assert!(record.host_port.is_some());
        assert!(record.container_id.is_some());
    }

    #[tokio::test]
    async fn hung_build_is_cut_off_by_build_timeout() {
        let builder = FakeImageBuilder::new();
        builder.delay_next(Duration::from_secs(10));

        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ProgramRegistry::open(dir.path()).unwrap());
        let port_range = PortRangeConfig { start: 29160, end: 29161 };
        let ports = Arc::new(PortAllocator::new(port_range));
        let supervisor = Arc::new(FakeContainerSupervisor::new());
        let mut config = (*test_config(dir.path().to_path_buf(), port_range)).clone();
        config.build_timeout = Duration::from_millis(50);
        let engine = LifecycleEngine::new(registry, ports, Arc::new(builder), supervisor, Arc::new(config));

        let (user_id, dockerfile, files) = trivial_submission();
        let id = engine.submit(user_id, dockerfile, files).unwrap();

        let record = wait_until(&engine, &id, ProgramState::BuildFailed, Duration::from_secs(2)).await;
        assert_eq!(record.state, ProgramState::BuildFailed);
        assert!(record.error_msg.as_deref().unwrap_or_default().contains("timed out"));
    }

    #[tokio::test]
    async fn build_failure_leaves_no_port_assigned() {
        let builder = FakeImageBuilder::new();
        builder.fail_next();
        let (engine, _supervisor, _dir) =
            test_engine_with_builder(PortRangeConfig { start: 29102, end: 29103 }, builder);

        let (user_id, dockerfile, files) = trivial_submission();
        let id = engine.submit(user_id, dockerfile, files).unwrap();

        let record = wait_until(&engine, &id, ProgramState::BuildFailed, Duration::from_secs(2)).await;
        assert_eq!(record.state, ProgramState::BuildFailed);
        assert!(record.host_port.is_none());
        assert!(record.error_msg.is_some());
    }

    #[tokio::test]
    async fn second_program_errors_on_port_exhaustion() {
        let (engine, _supervisor, _dir) = test_engine(PortRangeConfig { start: 29106, end: 29106 });

        let (u1, d1, f1) = trivial_submission();
        let first = engine.submit(u1, d1, f1).unwrap();
        wait_until(&engine, &first, ProgramState::Created, Duration::from_secs(2)).await;

        let (u2, d2, f2) = trivial_submission();
        let second = engine.submit(u2, d2, f2).unwrap();
        let record = wait_until(&engine, &second, ProgramState::Error, Duration::from_secs(2)).await;

        assert_eq!(record.state, ProgramState::Error);
        assert!(record.error_msg.as_deref().unwrap_or_default().contains("port"));
    }

    #[tokio::test]
    async fn distinct_programs_hold_distinct_ports() {
        let (engine, _supervisor, _dir) = test_engine(PortRangeConfig { start: 29120, end: 29129 });

        let (u1, d1, f1) = trivial_submission();
        let first = engine.submit(u1, d1, f1).unwrap();
        let created = wait_until(&engine, &first, ProgramState::Created, Duration::from_secs(2)).await;

        let (u2, d2, f2) = trivial_submission();
        let second = engine.submit(u2, d2, f2).unwrap();
        let created2 = wait_until(&engine, &second, ProgramState::Created, Duration::from_secs(2)).await;

        assert_ne!(created.host_port, created2.host_port);
    }

    #[tokio::test]
    async fn ready_program_releases_port_and_removes_container_on_stop() {
        let (engine, supervisor, _dir) = test_engine(PortRangeConfig { start: 29130, end: 29131 });
        let (user_id, dockerfile, files) = trivial_submission();
        let id = engine.submit(user_id, dockerfile, files).unwrap();

        let created = wait_until(&engine, &id, ProgramState::Created, Duration::from_secs(2)).await;
        let host_port = created.host_port.unwrap();
        spawn_fake_watcher(host_port).await;

        engine.start(&id).await.unwrap();
        let ready = wait_until(&engine, &id, ProgramState::Ready, Duration::from_secs(3)).await;
        assert_eq!(ready.state, ProgramState::Ready);
        assert_eq!(ready.host_port, Some(host_port));

        engine.stop(&id).await.unwrap();
        let stopped = wait_until(&engine, &id, ProgramState::Stopped, Duration::from_secs(3)).await;
        assert_eq!(stopped.state, ProgramState::Stopped);
        assert_eq!(stopped.host_port, None);
        assert!(supervisor.removed_ids().contains(&created.container_id.unwrap()));

        // the port is back in the free set and immediately reacquirable
        let (u2, d2, f2) = trivial_submission();
        let other = engine.submit(u2, d2, f2).unwrap();
        let other_created = wait_until(&engine, &other, ProgramState::Created, Duration::from_secs(2)).await;
        assert_eq!(other_created.host_port, Some(host_port));
    }

    #[tokio::test]
    async fn delete_before_terminal_is_rejected() {
        let (engine, _supervisor, _dir) = test_engine(PortRangeConfig { start: 29140, end: 29141 });
        let (user_id, dockerfile, files) = trivial_submission();
        let id = engine.submit(user_id, dockerfile, files).unwrap();
        wait_until(&engine, &id, ProgramState::Created, Duration::from_secs(2)).await;

        assert!(engine.delete(&id).is_err());
    }

    #[tokio::test]
    async fn stop_before_ready_settles_in_error_not_stopped() {
        let (engine, _supervisor, _dir) = test_engine(PortRangeConfig { start: 29150, end: 29151 });
        let (user_id, dockerfile, files) = trivial_submission();
        let id = engine.submit(user_id, dockerfile, files).unwrap();
        wait_until(&engine, &id, ProgramState::Created, Duration::from_secs(2)).await;

        engine.stop(&id).await.unwrap();
        let record = wait_until(&engine, &id, ProgramState::Error, Duration::from_secs(2)).await;
        assert_eq!(record.state, ProgramState::Error);
    }
}
