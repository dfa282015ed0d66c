//! Port leasing for program containers.
//!
//! A single mutex-guarded free-set over a configurable inclusive range.
//! Contention here is negligible compared to build/start work, so a plain
//! `parking_lot::Mutex` is enough — no need for the per-record worker
//! isolation the `LifecycleEngine` uses.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use thiserror::Error;

use crate::config::PortRangeConfig;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("port range exhausted")]
    Exhausted,
}

pub struct PortAllocator {
    free: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRangeConfig) -> Self {
        let free = (range.start..=range.end).collect();
        Self { free: Mutex::new(free) }
    }

    /// Atomically claims the lowest free port in the range, or `Exhausted`.
    pub fn acquire(&self) -> Result<u16, PortError> {
        let mut free = self.free.lock();
        let port = *free.iter().next().ok_or(PortError::Exhausted)?;
        free.remove(&port);
        Ok(port)
    }

    /// Returns `port` to the free set. Idempotent: releasing a port twice
    /// (a defensive double-cleanup) is a no-op rather than a panic. No
    /// quarantine window — the container engine guarantees socket teardown
    /// before `ContainerSupervisor::stop` returns, so a released port is
    /// immediately re-acquirable.
    pub fn release(&self, port: u16) {
        self.free.lock().insert(port);
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u16, end: u16) -> PortRangeConfig {
        PortRangeConfig { start, end }
    }

    #[test]
    fn acquires_distinct_ports_until_exhausted() {
        let allocator = PortAllocator::new(range(19000, 19001));
        let a = allocator.acquire().unwrap();
        let b = allocator.acquire().unwrap();
        assert_ne!(a, b);
        assert!(matches!(allocator.acquire(), Err(PortError::Exhausted)));
    }

    #[test]
    fn released_port_is_immediately_reacquirable() {
        let allocator = PortAllocator::new(range(19000, 19000));
        let p = allocator.acquire().unwrap();
        allocator.release(p);
        assert_eq!(allocator.acquire().unwrap(), p);
    }

    #[test]
    fn double_release_is_not_an_error() {
        let allocator = PortAllocator::new(range(19000, 19001));
        let p = allocator.acquire().unwrap();
        allocator.release(p);
        allocator.release(p);
        assert_eq!(allocator.available(), 2);
    }
}
