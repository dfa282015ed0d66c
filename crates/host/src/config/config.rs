//! Configuration structures and loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, #[source] source: std::io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, #[source] source: toml::de::Error },

    #[error("invalid port range '{0}': expected START-END with START <= END")]
    InvalidPortRange(String),

    #[error("failed to create directory {path}: {source}")]
    Directory { path: String, #[source] source: std::io::Error },
}

/// Host daemon configuration. Loaded from a TOML file, then overlaid with
/// the `HOST_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub debug: bool,

    /// Control-plane HTTP listen address, e.g. `:9000` or `0.0.0.0:9000`.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Root directory holding per-program source/build directories and the
    /// `registry.log` append-only transition log.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Inclusive range of host ports the `PortAllocator` may lease.
    #[serde(default)]
    pub port_range: PortRangeConfig,

    /// Upper bound on a single image build.
    #[serde(default = "default_build_timeout", with = "humantime_serde")]
    pub build_timeout: Duration,

    /// Upper bound on waiting for a container's Watcher API to become
    /// reachable after start.
    #[serde(default = "default_start_timeout", with = "humantime_serde")]
    pub start_timeout: Duration,

    /// Deadline for draining Ready/Starting programs through Stopping on
    /// host shutdown.
    #[serde(default = "default_shutdown_deadline", with = "humantime_serde")]
    pub shutdown_deadline: Duration,

    #[serde(default)]
    pub docker: DockerConfiguration,
}

/// Inclusive `[start, end]` port range, parsed from either TOML
/// (`[port_range] start = 19000 \n end = 19999`) or the `HOST_PORT_RANGE`
/// environment variable (`19000-19999`).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PortRangeConfig {
    #[serde(default = "default_port_range_start")]
    pub start: u16,
    #[serde(default = "default_port_range_end")]
    pub end: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self { start: default_port_range_start(), end: default_port_range_end() }
    }
}

impl PortRangeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start == 0 || self.end == 0 || self.start > self.end {
            return Err(ConfigError::InvalidPortRange(format!("{}-{}", self.start, self.end)));
        }
        Ok(())
    }

    fn parse(raw: &str) -> Result<Self, ConfigError> {
        let (start, end) = raw
            .split_once('-')
            .ok_or_else(|| ConfigError::InvalidPortRange(raw.to_string()))?;

        let start: u16 = start.trim().parse().map_err(|_| ConfigError::InvalidPortRange(raw.to_string()))?;
        let end: u16 = end.trim().parse().map_err(|_| ConfigError::InvalidPortRange(raw.to_string()))?;

        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }
}

fn default_listen_addr() -> String {
    ":9000".into()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".program-host")
}

fn default_port_range_start() -> u16 {
    19000
}

fn default_port_range_end() -> u16 {
    19999
}

fn default_build_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_start_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_deadline() -> Duration {
    Duration::from_secs(30)
}

/// Docker Engine connection settings shared by the `ImageBuilder` and
/// `ContainerSupervisor`.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfiguration {
    #[serde(default = "default_docker_socket")]
    pub socket: String,

    #[serde(default)]
    pub network: NetworkConfiguration,

    /// PID limit applied to every program container.
    #[serde(default = "default_container_pid_limit")]
    pub container_pid_limit: i64,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
            network: NetworkConfiguration::default(),
            container_pid_limit: default_container_pid_limit(),
        }
    }
}

fn default_docker_socket() -> String {
    #[cfg(target_os = "windows")]
    {
        "npipe:////./pipe/docker_engine".into()
    }
    #[cfg(not(target_os = "windows"))]
    {
        "/var/run/docker.sock".into()
    }
}

fn default_container_pid_limit() -> i64 {
    512
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfiguration {
    #[serde(default = "default_network_name")]
    pub name: String,
}

fn default_network_name() -> String {
    "bridge".into()
}

impl Configuration {
    /// Loads configuration from a TOML file, resolves `storage_dir`
    /// relative to the config file's parent directory, overlays the
    /// `HOST_*` environment variables, and ensures the storage directory
    /// exists.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config_path = Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .map_err(|source| ConfigError::Read { path: path.to_string(), source })?;

        let mut config: Configuration = toml::from_str(&content)
            .map_err(|source| ConfigError::Parse { path: path.to_string(), source })?;

        let base_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        if config.storage_dir.is_relative() {
            config.storage_dir = base_dir.join(&config.storage_dir);
        }

        config.apply_env_overlay()?;
        config.port_range.validate()?;

        std::fs::create_dir_all(&config.storage_dir)
            .map_err(|source| ConfigError::Directory {
                path: config.storage_dir.display().to_string(),
                source,
            })?;

        Ok(config)
    }

    fn apply_env_overlay(&mut self) -> Result<(), ConfigError> {
        if let Ok(addr) = std::env::var("HOST_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(dir) = std::env::var("HOST_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Ok(range) = std::env::var("HOST_PORT_RANGE") {
            self.port_range = PortRangeConfig::parse(&range)?;
        }
        if let Ok(secs) = std::env::var("HOST_BUILD_TIMEOUT") {
            if let Ok(secs) = secs.parse::<u64>() {
                self.build_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(secs) = std::env::var("HOST_START_TIMEOUT") {
            if let Ok(secs) = secs.parse::<u64>() {
                self.start_timeout = Duration::from_secs(secs);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_rejects_inverted_bounds() {
        let range = PortRangeConfig { start: 20000, end: 19000 };
        assert!(range.validate().is_err());
    }

    #[test]
    fn port_range_parses_dash_separated_string() {
        let range = PortRangeConfig::parse("19000-19999").unwrap();
        assert_eq!(range.start, 19000);
        assert_eq!(range.end, 19999);
    }

    #[test]
    fn port_range_parse_rejects_garbage() {
        assert!(PortRangeConfig::parse("not-a-range").is_err());
    }
}
