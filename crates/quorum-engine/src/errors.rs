use thiserror::Error;

use crate::engine::Turn;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("pipeline extension failed: {0}")]
    Extension(String),

    #[error("event emitter failed: {0}")]
    Emitter(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Model(#[from] quorum_llm::LlmError),

    #[error(transparent)]
    Store(#[from] quorum_store::StoreError),

    #[error("turn {turn_id} failed: {source}")]
    TurnFailed {
        turn_id: String,
        turn: Box<Turn>,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Short classifier written into step/turn metadata alongside the message.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidConfiguration(_) => "InvalidConfigurationError",
            Self::Extension(_) => "ExtensionError",
            Self::Emitter(_) => "EmitterError",
            Self::Serialization(_) => "SerializationError",
            Self::Model(_) => "ModelError",
            Self::Store(_) => "StoreError",
            Self::TurnFailed { .. } => "TurnFailedError",
        }
    }

    pub fn serialized(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "message": self.to_string(),
        })
    }
}
