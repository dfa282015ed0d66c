//! Construction-time configuration for a [`Watcher`](crate::runtime::Watcher).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::DropPolicy;

fn default_server_port() -> u16 {
    8080
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_queue_capacity() -> usize {
    256
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatcherConfig {
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Per-message handler deadline.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub drop_policy: DropPolicy,

    /// How long `Stop()` waits for the queue to drain before discarding
    /// whatever remains.
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            server_port: default_server_port(),
            default_timeout: default_timeout(),
            queue_capacity: default_queue_capacity(),
            drop_policy: DropPolicy::default(),
            drain_timeout: default_drain_timeout(),
        }
    }
}
