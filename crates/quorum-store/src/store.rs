use async_trait::async_trait;
use thiserror::Error;

use crate::types::{BaseSnapshotRecord, LifecycleRecord, MessageEventRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("store backend failed: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence contract for message state and lifecycle rows.
///
/// `load_base_snapshot` returns the most recent snapshot for an instance;
/// the snapshot log itself keeps every settled record. Message events for an
/// instance accumulate until `clear_message_events` consolidates them away.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn write_base_snapshot(&self, record: BaseSnapshotRecord) -> StoreResult<()>;

    async fn load_base_snapshot(
        &self,
        instance_id: &str,
    ) -> StoreResult<Option<BaseSnapshotRecord>>;

    async fn append_message_event(&self, record: MessageEventRecord) -> StoreResult<()>;

    /// Staged events for an instance, in ascending `seq` order.
    async fn load_message_events(&self, instance_id: &str)
    -> StoreResult<Vec<MessageEventRecord>>;

    async fn clear_message_events(&self, instance_id: &str) -> StoreResult<()>;

    async fn append_lifecycle(&self, record: LifecycleRecord) -> StoreResult<()>;
}
