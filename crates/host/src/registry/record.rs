//! `ProgramRecord` and its state machine.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ProgramId = String;

const MAX_BUILD_LOG_LINES: usize = 2000;

/// A tail-truncated, append-only capture buffer: bounds retained output
/// rather than letting it grow unbounded, with an explicit truncation
/// marker instead of silently dropping the head.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoundedLog {
    lines: VecDeque<String>,
    truncated: bool,
}

impl BoundedLog {
    pub fn push_line(&mut self, line: impl Into<String>) {
        if self.lines.len() >= MAX_BUILD_LOG_LINES {
            self.lines.pop_front();
            self.truncated = true;
        }
        self.lines.push_back(line.into());
    }

    pub fn text(&self) -> String {
        let mut out = String::new();
        if self.truncated {
            out.push_str("... [truncated, showing last ");
            out.push_str(&self.lines.len().to_string());
            out.push_str(" lines] ...\n");
        }
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ProgramState {
    Pending,
    Building,
    BuildFailed,
    Created,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Error,
}

impl ProgramState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramState::Pending => "Pending",
            ProgramState::Building => "Building",
            ProgramState::BuildFailed => "BuildFailed",
            ProgramState::Created => "Created",
            ProgramState::Starting => "Starting",
            ProgramState::Ready => "Ready",
            ProgramState::Stopping => "Stopping",
            ProgramState::Stopped => "Stopped",
            ProgramState::Error => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgramState::BuildFailed | ProgramState::Stopped | ProgramState::Error)
    }

    /// Whether `to` is a legal transition from `self`.
    /// `Error` is reachable from any non-terminal state.
    pub fn can_transition_to(&self, to: ProgramState) -> bool {
        use ProgramState::*;
        if self.is_terminal() {
            return false;
        }
        if to == Error {
            return true;
        }
        matches!(
            (self, to),
            (Pending, Building)
                | (Building, Created)
                | (Building, BuildFailed)
                | (Created, Starting)
                | (Starting, Ready)
                | (Ready, Stopping)
                | (Stopping, Stopped)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramRecord {
    pub program_id: ProgramId,
    pub user_id: String,
    pub source_files: HashMap<String, String>,
    pub image_tag: Option<String>,
    pub container_id: Option<String>,
    pub host_port: Option<u16>,
    pub state: ProgramState,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
    pub build_log: BoundedLog,
}

impl ProgramRecord {
    pub fn new(program_id: ProgramId, user_id: String, source_files: HashMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            program_id,
            user_id,
            source_files,
            image_tag: None,
            container_id: None,
            host_port: None,
            state: ProgramState::Pending,
            error_msg: None,
            created_at: now,
            state_changed_at: now,
            build_log: BoundedLog::default(),
        }
    }

    /// Applies a state transition if legal, updating `state_changed_at` and
    /// clearing/propagating `host_port`/`error_msg`. Returns `false` (and
    /// leaves the record untouched) if the transition is illegal.
    pub fn transition(&mut self, to: ProgramState, error_msg: Option<String>) -> bool {
        if !self.state.can_transition_to(to) {
            return false;
        }
        self.state = to;
        self.state_changed_at = Utc::now();
        if to.is_terminal() {
            self.host_port = None;
        }
        if matches!(to, ProgramState::BuildFailed | ProgramState::Error) {
            self.error_msg = error_msg;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_a_legal_walk() {
        use ProgramState::*;
        let mut rec = ProgramRecord::new("p1".into(), "u1".into(), HashMap::new());
        assert!(rec.transition(Building, None));
        assert!(rec.transition(Created, None));
        assert!(rec.transition(Starting, None));
        assert!(rec.transition(Ready, None));
        assert!(rec.transition(Stopping, None));
        assert!(rec.transition(Stopped, None));
        assert_eq!(rec.state, Stopped);
    }

    #[test]
    fn terminal_states_are_sticky() {
        use ProgramState::*;
        let mut rec = ProgramRecord::new("p1".into(), "u1".into(), HashMap::new());
        rec.transition(Building, None);
        rec.transition(BuildFailed, Some("bad dockerfile".into()));
        assert!(!rec.transition(Building, None));
        assert_eq!(rec.state, BuildFailed);
    }

    #[test]
    fn error_reachable_from_any_nonterminal_state() {
        use ProgramState::*;
        let mut rec = ProgramRecord::new("p1".into(), "u1".into(), HashMap::new());
        assert!(rec.transition(Error, Some("port exhausted".into())));
    }

    #[test]
    fn terminal_transition_clears_host_port() {
        use ProgramState::*;
        let mut rec = ProgramRecord::new("p1".into(), "u1".into(), HashMap::new());
        rec.host_port = Some(19000);
        rec.transition(Error, Some("boom".into()));
        assert_eq!(rec.host_port, None);
    }
}
