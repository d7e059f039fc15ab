//! Turn-execution engine: event-sourced message state, the step state
//! machine, the extension pipeline, and revision-isolated tool execution.
//!
//! The engine is deliberately host-agnostic. Providers, configuration,
//! persistence, tool modules, and inter-agent messaging all enter through
//! traits ([`quorum_llm::ModelProvider`], [`config::ConfigLoader`],
//! [`quorum_store::StateStore`], [`worker::ToolModuleLoader`],
//! [`link::AgentLink`]); the runtime crate wires them together.

pub mod catalog;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod link;
pub mod messages;
pub mod pipeline;
pub mod schema;
pub mod worker;

pub use catalog::{ToolCallResult, ToolCatalogItem, ToolResource, ToolResultStatus};
pub use config::{ConfigLoader, EffectiveConfig, EngineConfig, RevisionRef, StaticConfigLoader};
pub use engine::{
    AgentInstance, Step, StepStatus, Turn, TurnEngine, TurnInput, TurnMetrics, TurnStatus,
};
pub use errors::EngineError;
pub use events::{BufferedEventEmitter, EventEmitter, EventKind, NoopEventEmitter, RuntimeEvent};
pub use link::{
    AgentCatalogEntry, AgentErrorCode, AgentLink, AgentRequestError, AgentSummary, RequestOptions,
    RequestReply, SpawnOptions, SpawnOutcome,
};
pub use messages::{InboundEvent, Message, MessageEvent, TurnMessageState};
pub use pipeline::{PipelineRegistry, RegisterOptions, StepPoint, ToolCallPoint, TurnPoint};
pub use worker::{
    ToolContext, ToolHandler, ToolHandlerError, ToolModuleLoader, ToolRegistry, WorkerHost,
    WorkerPool,
};
