//! Messages flowing through the Watcher's dispatch queue.

use std::time::{SystemTime, UNIX_EPOCH};

/// A single unit of work handed to every registered [`ManagedFunction`](crate::dispatcher::ManagedFunction).
#[derive(Debug, Clone)]
pub struct Message {
    pub content: String,
    pub arrived_at: u128,
    pub sequence: u64,
}

impl Message {
    pub(crate) fn new(content: String, sequence: u64) -> Self {
        let arrived_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        Self { content, arrived_at, sequence }
    }
}
