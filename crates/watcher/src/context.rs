//! The per-Watcher value store, environment view, and cancellation signal
//! shared between the dispatcher and the HTTP introspection API.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::error::{WatcherError, WatcherResult};

/// A heterogeneous value stored in a [`HershContext`]. Tagged rather than
/// `serde_json::Value` directly so callers can round-trip bytes and
/// distinguish integers from floats; the API layer projects these down to
/// JSON at read time.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
}

impl Value {
    /// Project to JSON for the introspection API. Bytes have no natural JSON
    /// form, so they fall back to a string.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Int64(v) => JsonValue::from(*v),
            Value::Float64(v) => JsonValue::from(*v),
            Value::String(v) => JsonValue::from(v.clone()),
            Value::Bytes(v) => JsonValue::from(hex::encode(v)),
            Value::Json(v) => v.clone(),
        }
    }
}

/// Per-Watcher shared state: the dynamic value store, a read-only snapshot
/// of the process environment, and a cancellation signal handlers may
/// observe to cooperatively wind down long-running work.
pub struct HershContext {
    values: RwLock<HashMap<String, Value>>,
    env: HashMap<String, String>,
    cancellation: CancellationToken,
}

impl HershContext {
    pub fn new(env: HashMap<String, String>, cancellation: CancellationToken) -> Self {
        Self { values: RwLock::new(HashMap::new()), env, cancellation }
    }

    pub fn get_value(&self, key: &str) -> WatcherResult<Value> {
        self.values
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| WatcherError::KeyNotFound(key.to_string()))
    }

    pub fn set_value(&self, key: impl Into<String>, value: Value) {
        self.values.write().insert(key.into(), value);
    }

    /// A JSON snapshot of every stored value, for `GET /watcher/values`.
    pub fn snapshot(&self) -> HashMap<String, JsonValue> {
        self.values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let ctx = HershContext::new(HashMap::new(), CancellationToken::new());
        ctx.set_value("COUNTER", Value::Int64(5));
        assert_eq!(ctx.get_value("COUNTER").unwrap(), Value::Int64(5));
    }

    #[test]
    fn missing_key_is_not_found() {
        let ctx = HershContext::new(HashMap::new(), CancellationToken::new());
        assert!(matches!(ctx.get_value("nope"), Err(WatcherError::KeyNotFound(_))));
    }

    #[test]
    fn snapshot_projects_bytes_to_hex_string() {
        let ctx = HershContext::new(HashMap::new(), CancellationToken::new());
        ctx.set_value("raw", Value::Bytes(vec![0xde, 0xad]));
        let snap = ctx.snapshot();
        assert_eq!(snap["raw"], JsonValue::from("dead"));
    }
}
