use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One consolidated base written at turn settlement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BaseSnapshotRecord {
    pub trace_id: String,
    pub instance_id: String,
    pub instance_key: String,
    pub agent_name: String,
    pub turn_id: String,
    pub messages: Vec<Value>,
    /// Number of staged events folded into this snapshot.
    pub source_event_count: usize,
}

/// Category of a persisted message event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedEventType {
    SystemMessage,
    LlmMessage,
    Replace,
    Remove,
    Truncate,
}

/// One staged message event, append-only until consolidated then cleared.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageEventRecord {
    pub trace_id: String,
    pub instance_id: String,
    pub turn_id: String,
    pub seq: u64,
    pub event_type: PersistedEventType,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

/// Observability row. Written by the engine, never read back by it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub trace_id: String,
    pub instance_id: String,
    pub kind: String,
    pub timestamp_ms: u64,
    pub data: Value,
}
