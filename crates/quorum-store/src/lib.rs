//! Persistence layer for the quorum engine.
//!
//! Two append-style logs back the engine's crash recovery: a base-message
//! snapshot log (one record per settled turn) and a message-event log that
//! stays append-only until the turn consolidates it into the next snapshot.
//! A third lifecycle log records observability rows the engine never reads
//! back.

mod fs;
mod memory;
mod store;
mod types;

pub use fs::FsStateStore;
pub use memory::MemoryStateStore;
pub use store::{StateStore, StoreError, StoreResult};
pub use types::{
    BaseSnapshotRecord, LifecycleRecord, MessageEventRecord, PersistedEventType,
};
