//! Wire protocol between the supervisor and agent processes.
//!
//! Everything crossing the process boundary is an [`IpcEnvelope`]. Agent
//! calls ride in `event` envelopes as [`AgentCallPayload`]; `shutdown` and
//! `shutdown_ack` drive the drain handshake. Response correlation uses the
//! `inReplyTo` metadata key rather than a dedicated field, which keeps the
//! payload shape uniform across call kinds.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const META_IN_REPLY_TO: &str = "inReplyTo";
pub const META_ERROR_CODE: &str = "errorCode";
pub const META_ERROR_MESSAGE: &str = "errorMessage";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Event,
    Shutdown,
    ShutdownAck,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpcEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<AgentCallPayload>,
}

impl IpcEnvelope {
    pub fn event(from: impl Into<String>, to: impl Into<String>, payload: AgentCallPayload) -> Self {
        Self {
            kind: EnvelopeKind::Event,
            from: from.into(),
            to: to.into(),
            payload: Some(payload),
        }
    }

    pub fn shutdown(to: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Shutdown,
            from: "supervisor".to_string(),
            to: to.into(),
            payload: None,
        }
    }

    pub fn shutdown_ack(from: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::ShutdownAck,
            from: from.into(),
            to: "supervisor".to_string(),
            payload: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Request,
    Notification,
    Response,
    ErrorResponse,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSource {
    pub kind: String,
    pub name: String,
}

/// One inter-agent call. `call_stack` carries every agent address already on
/// the synchronous path, caller first; cycle detection reads it before
/// dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCallPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CallKind,
    pub input: Value,
    pub source: CallSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub instance_key: String,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub call_stack: Vec<String>,
}

impl AgentCallPayload {
    pub fn request(
        input: Value,
        source: CallSource,
        reply_to: impl Into<String>,
        instance_key: impl Into<String>,
        trace_id: impl Into<String>,
        call_stack: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: CallKind::Request,
            input,
            source,
            reply_to: Some(reply_to.into()),
            instance_key: instance_key.into(),
            trace_id: trace_id.into(),
            metadata: BTreeMap::new(),
            auth: None,
            call_stack,
        }
    }

    pub fn notification(
        input: Value,
        source: CallSource,
        instance_key: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: CallKind::Notification,
            input,
            source,
            reply_to: None,
            instance_key: instance_key.into(),
            trace_id: trace_id.into(),
            metadata: BTreeMap::new(),
            auth: None,
            call_stack: Vec::new(),
        }
    }

    /// Successful reply correlated to `request_id`.
    pub fn response(request_id: &str, value: Value, source: CallSource, trace_id: &str) -> Self {
        let mut payload = Self {
            id: Uuid::new_v4().to_string(),
            kind: CallKind::Response,
            input: value,
            source,
            reply_to: None,
            instance_key: String::new(),
            trace_id: trace_id.to_string(),
            metadata: BTreeMap::new(),
            auth: None,
            call_stack: Vec::new(),
        };
        payload
            .metadata
            .insert(META_IN_REPLY_TO.to_string(), Value::String(request_id.to_string()));
        payload
    }

    pub fn error_response(
        request_id: &str,
        code: &str,
        message: &str,
        source: CallSource,
        trace_id: &str,
    ) -> Self {
        let mut payload = Self::response(request_id, Value::Null, source, trace_id);
        payload.kind = CallKind::ErrorResponse;
        payload
            .metadata
            .insert(META_ERROR_CODE.to_string(), Value::String(code.to_string()));
        payload.metadata.insert(
            META_ERROR_MESSAGE.to_string(),
            Value::String(message.to_string()),
        );
        payload
    }

    pub fn in_reply_to(&self) -> Option<&str> {
        self.metadata.get(META_IN_REPLY_TO).and_then(Value::as_str)
    }

    pub fn error_code(&self) -> Option<&str> {
        self.metadata.get(META_ERROR_CODE).and_then(Value::as_str)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.metadata.get(META_ERROR_MESSAGE).and_then(Value::as_str)
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.kind, CallKind::Response | CallKind::ErrorResponse)
    }
}
