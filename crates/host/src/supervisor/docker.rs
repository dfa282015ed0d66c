//! Docker-backed `ContainerSupervisor`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig, Mount, MountTypeEnum, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use tracing::{info, warn};

use crate::config::DockerConfiguration;

use super::traits::{ContainerSupervisor, Inspection, SupervisorError};

/// The fixed internal port every program's Watcher API listens on, per the
/// container contract.
const WATCHER_INTERNAL_PORT: u16 = 8080;

pub struct DockerSupervisor {
    client: Docker,
    network: String,
    pid_limit: i64,
}

impl DockerSupervisor {
    pub fn new(client: Docker, config: &DockerConfiguration) -> Self {
        Self {
            client,
            network: config.network.name.clone(),
            pid_limit: config.container_pid_limit,
        }
    }

    fn dropped_capabilities() -> Vec<String> {
        vec![
            "setpcap",
            "mknod",
            "audit_write",
            "net_raw",
            "dac_override",
            "fowner",
            "fsetid",
            "net_bind_service",
            "sys_chroot",
            "setfcap",
            "audit_control",
            "audit_read",
            "block_suspend",
            "dac_read_search",
            "ipc_lock",
            "ipc_owner",
            "lease",
            "linux_immutable",
            "mac_admin",
            "mac_override",
            "net_admin",
            "net_broadcast",
            "syslog",
            "sys_admin",
            "sys_boot",
            "sys_module",
            "sys_nice",
            "sys_pacct",
            "sys_ptrace",
            "sys_rawio",
            "sys_resource",
            "sys_time",
            "sys_tty_config",
            "wake_alarm",
        ]
        .into_iter()
        .map(|s| s.to_uppercase())
        .collect()
    }

    /// Retries a transient engine call up to 3 times with exponential
    /// backoff: transient container-engine errors are retried a bounded
    /// number of times before being surfaced as permanent.
    async fn with_retry<T, F, Fut>(op: F) -> Result<T, SupervisorError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, bollard::errors::Error>>,
    {
        let mut attempts = 0u32;
        let backoff_policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(5)),
            ..ExponentialBackoff::default()
        };

        retry(backoff_policy, || async {
            attempts += 1;
            op().await.map_err(|err| {
                if attempts >= 3 {
                    backoff::Error::permanent(err)
                } else {
                    backoff::Error::transient(err)
                }
            })
        })
        .await
        .map_err(SupervisorError::Engine)
    }
}

#[async_trait]
impl ContainerSupervisor for DockerSupervisor {
    async fn create(
        &self,
        program_id: &str,
        image_tag: &str,
        host_port: u16,
        env: &HashMap<String, String>,
        state_dir: &std::path::Path,
    ) -> Result<String, SupervisorError> {
        let container_port_key = format!("{}/tcp", WATCHER_INTERNAL_PORT);

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            container_port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(container_port_key, HashMap::new());

        let mut env_list: Vec<String> =
            env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env_list.push("HERSH_STATE_DIR=/state".to_string());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: Some(self.network.clone()),
            mounts: Some(vec![Mount {
                target: Some("/state".to_string()),
                source: Some(state_dir.display().to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            }]),
            cap_drop: Some(Self::dropped_capabilities()),
            pids_limit: Some(self.pid_limit),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(image_tag.to_string()),
            env: Some(env_list),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = format!("program-{program_id}");
        let options = CreateContainerOptions { name, platform: None };

        let response =
            Self::with_retry(|| self.client.create_container(Some(options.clone()), config.clone()))
                .await?;

        info!(program_id, container_id = %response.id, "container created");
        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> Result<(), SupervisorError> {
        Self::with_retry(|| {
            self.client
                .start_container(container_id, None::<bollard::container::StartContainerOptions<String>>)
        })
        .await
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), SupervisorError> {
        let options = StopContainerOptions { t: grace.as_secs() as i64 };
        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(err) => {
                warn!(container_id, error = %err, "stop_container failed");
                Err(SupervisorError::Engine(err))
            }
        }
    }

    async fn remove(&self, container_id: &str) -> Result<(), SupervisorError> {
        let options = RemoveContainerOptions { force: true, ..Default::default() };
        match self.client.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(err) => Err(SupervisorError::Engine(err)),
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<Inspection, SupervisorError> {
        let details = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(|err| match err {
                bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                    SupervisorError::NotFound(container_id.to_string())
                }
                other => SupervisorError::Engine(other),
            })?;

        let state = details.state.unwrap_or_default();
        let running = state.status == Some(ContainerStateStatusEnum::RUNNING);
        let exit_code = state.exit_code;

        Ok(Inspection { running, exit_code })
    }
}
