//! The append-only `registry.log` persistence hook.
//!
//! One JSON line per state transition: `{ts, program_id, from_state,
//! to_state, error_msg?}`. On restart the host replays this file to
//! reconstruct a skeleton registry before reconciling with the container
//! engine.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::record::ProgramState;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to open registry log {path}: {source}")]
    Open { path: String, #[source] source: std::io::Error },

    #[error("failed to append to registry log: {0}")]
    Append(#[source] std::io::Error),

    #[error("failed to replay registry log: {0}")]
    Replay(#[source] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub program_id: String,
    pub from_state: ProgramState,
    pub to_state: ProgramState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

pub struct RegistryLog {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl RegistryLog {
    pub fn open(storage_dir: &Path) -> Result<Self, RegistryError> {
        let path = storage_dir.join("registry.log");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| RegistryError::Open { path: path.display().to_string(), source })?;

        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn append(&self, entry: &LogEntry) -> Result<(), RegistryError> {
        let mut line = serde_json::to_string(entry).map_err(|e| {
            RegistryError::Append(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        line.push('\n');

        let mut file = self.file.lock();
        file.write_all(line.as_bytes()).map_err(RegistryError::Append)?;
        file.flush().map_err(RegistryError::Append)
    }

    /// Reads every recorded transition in order. Used at startup to
    /// reconstruct the last known state of each program before
    /// reconciliation with the container engine.
    pub fn replay(&self) -> Result<Vec<LogEntry>, RegistryError> {
        let file = std::fs::File::open(&self.path).map_err(RegistryError::Replay)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(RegistryError::Replay)?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(_) => continue, // tolerate a partially-written final line
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_replay_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log = RegistryLog::open(dir.path()).unwrap();
        log.append(&LogEntry {
            ts: Utc::now(),
            program_id: "p1".into(),
            from_state: ProgramState::Pending,
            to_state: ProgramState::Building,
            error_msg: None,
        })
        .unwrap();

        let entries = log.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].program_id, "p1");
        assert_eq!(entries[0].to_state, ProgramState::Building);
    }
}
