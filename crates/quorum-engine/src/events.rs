use crate::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub type EventData = HashMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TurnStart,
    TurnEnd,
    TurnInterrupted,
    StepStart,
    StepEnd,
    ToolCallStart,
    ToolCallEnd,
    GenerationCreated,
    GenerationEvicted,
    RequestRegistered,
    RequestResolved,
    InboxDelivered,
    ProcessReady,
    ProcessDraining,
    ProcessExited,
    Error,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub kind: EventKind,
    pub timestamp_ms: u64,
    pub trace_id: String,
    pub data: EventData,
}

impl RuntimeEvent {
    pub fn new(kind: EventKind, trace_id: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp_ms: now_ms(),
            trace_id: trace_id.into(),
            data: EventData::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn warning(trace_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventKind::Warning, trace_id).with("message", message.into())
    }

    pub fn error(trace_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, trace_id).with("message", message.into())
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: RuntimeEvent) -> Result<(), EngineError>;
}

#[derive(Default)]
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: RuntimeEvent) -> Result<(), EngineError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct BufferedEventEmitter {
    inner: Arc<Mutex<Vec<RuntimeEvent>>>,
}

impl BufferedEventEmitter {
    pub fn snapshot(&self) -> Vec<RuntimeEvent> {
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.snapshot().into_iter().map(|event| event.kind).collect()
    }
}

impl EventEmitter for BufferedEventEmitter {
    fn emit(&self, event: RuntimeEvent) -> Result<(), EngineError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| EngineError::Emitter("buffered emitter mutex poisoned".to_string()))?;
        guard.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_event_emitter_stores_emitted_events() {
        let emitter = BufferedEventEmitter::default();
        emitter
            .emit(RuntimeEvent::new(EventKind::TurnStart, "trace-1").with("turnId", "turn-1"))
            .expect("emit should succeed");

        let events = emitter.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::TurnStart);
        assert_eq!(events[0].data["turnId"], "turn-1");
    }
}
