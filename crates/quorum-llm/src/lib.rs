//! Model-capability abstraction for the quorum engine.
//!
//! The engine treats the model as a pluggable generate capability: it hands
//! over a system prompt, the current transcript, and a schema-described tool
//! catalog, and receives back one assistant message plus any tool-call
//! requests. Concrete provider clients live outside this workspace;
//! implementations of [`ModelProvider`] adapt them.

mod errors;
mod provider;
mod types;

pub use errors::LlmError;
pub use provider::ModelProvider;
pub use types::{
    ChatMessage, FinishReason, ModelRequest, ModelResponse, Role, ToolCall, ToolDefinition, Usage,
};
