use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Protocol-level error codes reported to inter-agent callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentErrorCode {
    AgentNotFound,
    CircularCallDetected,
    IpcDeliveryFailed,
    AgentRequestTimeout,
}

impl AgentErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::CircularCallDetected => "CIRCULAR_CALL_DETECTED",
            Self::IpcDeliveryFailed => "IPC_DELIVERY_FAILED",
            Self::AgentRequestTimeout => "AGENT_REQUEST_TIMEOUT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "AGENT_NOT_FOUND" => Some(Self::AgentNotFound),
            "CIRCULAR_CALL_DETECTED" => Some(Self::CircularCallDetected),
            "IPC_DELIVERY_FAILED" => Some(Self::IpcDeliveryFailed),
            "AGENT_REQUEST_TIMEOUT" => Some(Self::AgentRequestTimeout),
            _ => None,
        }
    }
}

impl fmt::Display for AgentErrorCode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct AgentRequestError {
    pub code: AgentErrorCode,
    pub message: String,
}

impl AgentRequestError {
    pub fn new(code: AgentErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(target: &str) -> Self {
        Self::new(
            AgentErrorCode::AgentNotFound,
            format!("no running agent instance matches '{target}'"),
        )
    }

    /// The error message spells out the cycle, caller first.
    pub fn circular(visited: &[String], target: &str) -> Self {
        let mut chain = visited.to_vec();
        chain.push(target.to_string());
        Self::new(
            AgentErrorCode::CircularCallDetected,
            format!("Circular call detected: {}", chain.join(" -> ")),
        )
    }

    pub fn delivery_failed(message: impl Into<String>) -> Self {
        Self::new(AgentErrorCode::IpcDeliveryFailed, message)
    }

    pub fn timeout(target: &str, timeout_ms: u64) -> Self {
        Self::new(
            AgentErrorCode::AgentRequestTimeout,
            format!("request to '{target}' timed out after {timeout_ms}ms"),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestOptions {
    pub timeout_ms: u64,
    /// Deliver the eventual reply into the requester's async inbox instead of
    /// blocking this call.
    pub async_mode: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            async_mode: false,
        }
    }
}

/// Result of `request`: a synchronous reply, or confirmation that an async
/// request was queued.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestReply {
    Completed(Value),
    Queued { request_id: String },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpawnOptions {
    pub instance_key: Option<String>,
    pub cwd: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOutcome {
    pub target: String,
    pub instance_key: String,
    pub spawned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub agent_name: String,
    pub instance_key: String,
    pub status: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCatalogEntry {
    pub name: String,
    pub description: String,
}

/// Inter-agent primitives handed to tool and extension code. The runtime
/// crate implements this over its router; the engine only consumes it.
#[async_trait]
pub trait AgentLink: Send + Sync {
    async fn request(
        &self,
        target: &str,
        input: Value,
        options: RequestOptions,
    ) -> Result<RequestReply, AgentRequestError>;

    /// Fire-and-forget delivery; success only means the event was accepted.
    async fn send(&self, target: &str, input: Value) -> Result<(), AgentRequestError>;

    async fn spawn(
        &self,
        target: &str,
        options: SpawnOptions,
    ) -> Result<SpawnOutcome, AgentRequestError>;

    async fn list(&self) -> Result<Vec<AgentSummary>, AgentRequestError>;

    async fn catalog(&self) -> Result<Vec<AgentCatalogEntry>, AgentRequestError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_error_spells_out_the_cycle() {
        let error = AgentRequestError::circular(
            &["planner@main".to_string(), "worker@main".to_string()],
            "planner@main",
        );
        assert_eq!(error.code, AgentErrorCode::CircularCallDetected);
        assert_eq!(
            error.message,
            "Circular call detected: planner@main -> worker@main -> planner@main"
        );
    }

    #[test]
    fn error_codes_round_trip_through_wire_form() {
        for code in [
            AgentErrorCode::AgentNotFound,
            AgentErrorCode::CircularCallDetected,
            AgentErrorCode::IpcDeliveryFailed,
            AgentErrorCode::AgentRequestTimeout,
        ] {
            assert_eq!(AgentErrorCode::parse(code.as_str()), Some(code));
        }
    }
}
