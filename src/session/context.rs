//! # Session Context Store
//!
//! Key-value store for values that flow between protocol stages: bootstrap
//! stages export tokens, nonces and intervals into the context, and later
//! serialization consumes them through `from_context` block attributes.
//!
//! Snapshots are lossless: byte strings and timestamps carry a type tag in
//! the JSON form so a restore recovers the exact runtime types, which is
//! what makes replayed sessions byte-identical to the originals.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared handle to a session's context. Lock sections must stay short
/// and never span an await; async callers snapshot with
/// [`ContextStore::deep_copy`] before I/O.
pub type ContextHandle = Arc<parking_lot::Mutex<ContextStore>>;

/// Fresh shared context.
pub fn new_context_handle() -> ContextHandle {
    Arc::new(parking_lot::Mutex::new(ContextStore::new()))
}

/// A context value. Everything JSON-native plus bytes and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    Null,
    Bool(bool),
    Uint(u64),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Array(Vec<ContextValue>),
    Map(BTreeMap<String, ContextValue>),
}

impl ContextValue {
    /// Tagged JSON form: bytes and timestamps get a `_type` marker, all
    /// other values serialize natively.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ContextValue::Null => serde_json::Value::Null,
            ContextValue::Bool(b) => json!(b),
            ContextValue::Uint(v) => json!(v),
            ContextValue::Int(v) => json!(v),
            ContextValue::Float(v) => json!(v),
            ContextValue::Str(s) => json!(s),
            ContextValue::Bytes(b) => json!({"_type": "bytes", "value": hex::encode(b)}),
            ContextValue::Timestamp(ts) => {
                json!({"_type": "datetime", "value": ts.to_rfc3339()})
            }
            ContextValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
            ContextValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Invert [`to_json`](Self::to_json), reconstructing tagged types.
    pub fn from_json(value: &serde_json::Value) -> ContextValue {
        match value {
            serde_json::Value::Null => ContextValue::Null,
            serde_json::Value::Bool(b) => ContextValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    ContextValue::Uint(u)
                } else if let Some(i) = n.as_i64() {
                    ContextValue::Int(i)
                } else {
                    ContextValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => ContextValue::Str(s.clone()),
            serde_json::Value::Array(items) => {
                ContextValue::Array(items.iter().map(ContextValue::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                match (map.get("_type").and_then(|t| t.as_str()), map.get("value")) {
                    (Some("bytes"), Some(raw)) => {
                        let decoded = raw
                            .as_str()
                            .and_then(|s| hex::decode(s).ok())
                            .unwrap_or_default();
                        ContextValue::Bytes(decoded)
                    }
                    (Some("datetime"), Some(raw)) => {
                        let parsed = raw
                            .as_str()
                            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                            .map(|dt| dt.with_timezone(&Utc));
                        match parsed {
                            Some(ts) => ContextValue::Timestamp(ts),
                            None => {
                                warn!("unparseable datetime in context snapshot");
                                ContextValue::Null
                            }
                        }
                    }
                    _ => ContextValue::Map(
                        map.iter()
                            .map(|(k, v)| (k.clone(), ContextValue::from_json(v)))
                            .collect(),
                    ),
                }
            }
        }
    }
}

/// Runtime key-value store for one orchestrated session.
#[derive(Debug, Clone, Default)]
pub struct ContextStore {
    values: BTreeMap<String, ContextValue>,
    bootstrap_complete: bool,
    last_updated: Option<DateTime<Utc>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: &str, value: ContextValue) {
        debug!(key, "context value set");
        self.values.insert(key.to_string(), value);
        self.last_updated = Some(Utc::now());
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns true when the key existed.
    pub fn delete(&mut self, key: &str) -> bool {
        let removed = self.values.remove(key).is_some();
        if removed {
            self.last_updated = Some(Utc::now());
        }
        removed
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Clear all values. Used when re-bootstrapping after a connection drop.
    pub fn clear(&mut self) {
        self.values.clear();
        self.bootstrap_complete = false;
        self.last_updated = None;
        debug!("context cleared");
    }

    pub fn bootstrap_complete(&self) -> bool {
        self.bootstrap_complete
    }

    pub fn set_bootstrap_complete(&mut self, complete: bool) {
        self.bootstrap_complete = complete;
        self.last_updated = Some(Utc::now());
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Serializable snapshot for persistence and execution records.
    pub fn snapshot(&self) -> serde_json::Value {
        let values: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        json!({
            "values": values,
            "bootstrap_complete": self.bootstrap_complete,
            "last_updated": self.last_updated.map(|ts| ts.to_rfc3339()),
        })
    }

    /// Rebuild a store from a snapshot.
    pub fn restore(snapshot: &serde_json::Value) -> Self {
        let mut store = Self::new();
        if let Some(values) = snapshot.get("values").and_then(|v| v.as_object()) {
            for (k, v) in values {
                store
                    .values
                    .insert(k.clone(), ContextValue::from_json(v));
            }
        }
        store.bootstrap_complete = snapshot
            .get("bootstrap_complete")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        store.last_updated = snapshot
            .get("last_updated")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        debug!(
            key_count = store.values.len(),
            bootstrap_complete = store.bootstrap_complete,
            "context restored"
        );
        store
    }

    /// Deep copy. `ContextValue` owns all of its data, so a clone is deep.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }
}
