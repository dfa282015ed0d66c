//! `ProgramRegistry`: a concurrency-safe `program_id → ProgramRecord` map
//! with a persistence hook.

mod log;
mod record;

pub use log::{LogEntry, RegistryError, RegistryLog};
pub use record::{BoundedLog, ProgramId, ProgramRecord, ProgramState};

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

/// Filter predicate for `ProgramRegistry::list`.
pub type ListFilter = dyn Fn(&ProgramRecord) -> bool + Send + Sync;

pub struct ProgramRegistry {
    records: DashMap<ProgramId, Arc<RwLock<ProgramRecord>>>,
    log: RegistryLog,
}

impl ProgramRegistry {
    /// Opens (or creates) `<storage_dir>/registry.log` and replays it to
    /// reconstruct a skeleton view of whatever programs existed before a
    /// restart. The log only records transitions, not full records
    /// (source files, image tag, container id), so any program left in a
    /// non-terminal state at the last recorded transition is conservatively
    /// moved to `Error` — its container identity can't be recovered from
    /// the log alone, and the caller has no supervisor handle to reconcile
    /// against at this point in bootstrap.
    pub fn open(storage_dir: &Path) -> Result<Self, RegistryError> {
        let log = RegistryLog::open(storage_dir)?;
        let records = DashMap::new();

        let mut last_state: std::collections::HashMap<ProgramId, (ProgramState, Option<String>)> =
            std::collections::HashMap::new();
        for entry in log.replay()? {
            last_state.insert(entry.program_id, (entry.to_state, entry.error_msg));
        }

        for (program_id, (state, error_msg)) in last_state {
            let mut record = ProgramRecord::new(program_id.clone(), String::new(), Default::default());
            if state.is_terminal() {
                record.transition(state, error_msg);
            } else {
                warn!(program_id = %program_id, recovered_state = state.as_str(), "non-terminal program found at restart; marking Error");
                record.transition(ProgramState::Error, Some("state lost across restart".into()));
            }
            records.insert(record.program_id.clone(), Arc::new(RwLock::new(record)));
        }

        info!(recovered = records.len(), "registry replayed from log");
        Ok(Self { records, log })
    }

    pub fn put(&self, record: ProgramRecord) {
        let id = record.program_id.clone();
        self.records.insert(id, Arc::new(RwLock::new(record)));
    }

    pub fn get(&self, id: &str) -> Option<Arc<RwLock<ProgramRecord>>> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn list(&self, filter: impl Fn(&ProgramRecord) -> bool) -> Vec<ProgramRecord> {
        self.records
            .iter()
            .filter_map(|entry| {
                let record = entry.value().read();
                filter(&record).then(|| record.clone())
            })
            .collect()
    }

    /// Applies `mutator` to the record under its per-record lock, appending
    /// a transition log entry if the state actually changed. Returns
    /// whatever the mutator returns, or `None` if `id` is unknown.
    pub fn update<T>(&self, id: &str, mutator: impl FnOnce(&mut ProgramRecord) -> T) -> Option<T> {
        let entry = self.records.get(id)?;
        let mut record = entry.value().write();
        let before = record.state;
        let result = mutator(&mut record);
        let after = record.state;

        if before != after {
            let log_entry = LogEntry {
                ts: chrono::Utc::now(),
                program_id: record.program_id.clone(),
                from_state: before,
                to_state: after,
                error_msg: record.error_msg.clone(),
            };
            if let Err(err) = self.log.append(&log_entry) {
                warn!(program_id = %record.program_id, error = %err, "failed to persist transition, marking record Error");
                // A persistence failure marks the record Error even
                // though the in-memory transition already happened, since
                // the transition isn't durable. `Error` is reachable from any
                // non-terminal state, so this always succeeds unless the
                // record already reached a terminal state this call.
                if !after.is_terminal() {
                    record.transition(ProgramState::Error, Some(format!("persistence error: {err}")));
                }
            }
        }

        Some(result)
    }

    pub fn delete(&self, id: &str) -> bool {
        self.records.remove(id).is_some()
    }
}
