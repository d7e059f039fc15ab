//! Multi-agent runtime over the quorum engine.
//!
//! One supervisor owns a set of agent definitions and spawns one serial
//! process per (agent, instance key). Agents reach each other through the
//! inter-agent protocol: synchronous requests with caller-side cycle
//! detection and timeouts, fire-and-forget notifications, and async requests
//! whose replies queue in a bounded inbox until the requester's next turn.

pub mod envelope;
pub mod inbox;
pub mod link;
pub mod pending;
mod process;
pub mod supervisor;


pub use envelope::{AgentCallPayload, CallKind, CallSource, EnvelopeKind, IpcEnvelope};
pub use inbox::{AsyncInbox, InboxEntry, InboxStatus, MAX_INBOX_ENTRIES};
pub use link::ProcessLink;
pub use pending::{MAX_PENDING_REQUESTS, PendingMap, STALE_AFTER};
pub use supervisor::{
    AgentDefinition, AgentFactory, AgentRuntime, DEFAULT_INSTANCE_KEY, format_address,
    parse_target,
};
