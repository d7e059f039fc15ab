use crate::memory::{MemoryState, MemoryStateStore};
use crate::store::{StateStore, StoreError, StoreResult};
use crate::types::{BaseSnapshotRecord, LifecycleRecord, MessageEventRecord};
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE_NAME: &str = "statestore-state.json";

/// Filesystem-backed store: the in-memory state serialized to one JSON file,
/// rewritten atomically (tmp file + rename) after every mutation.
#[derive(Clone, Debug)]
pub struct FsStateStore {
    state_file: PathBuf,
    inner: MemoryStateStore,
}

impl FsStateStore {
    pub fn new<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        fs::create_dir_all(root.as_ref())
            .map_err(|err| StoreError::Backend(format!("create fs store root failed: {err}")))?;
        let state_file = root.as_ref().join(STATE_FILE_NAME);
        let state = if state_file.exists() {
            let raw = fs::read(&state_file)
                .map_err(|err| StoreError::Backend(format!("read state file failed: {err}")))?;
            serde_json::from_slice::<MemoryState>(&raw)
                .map_err(|err| StoreError::Serialization(err.to_string()))?
        } else {
            MemoryState::default()
        };

        Ok(Self {
            state_file,
            inner: MemoryStateStore::from_state(state),
        })
    }

    fn persist(&self) -> StoreResult<()> {
        let snapshot = self.inner.snapshot()?;
        let raw = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let tmp = self.state_file.with_extension("json.tmp");
        fs::write(&tmp, raw)
            .map_err(|err| StoreError::Backend(format!("write state file failed: {err}")))?;
        fs::rename(&tmp, &self.state_file)
            .map_err(|err| StoreError::Backend(format!("rename state file failed: {err}")))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StateStore for FsStateStore {
    async fn write_base_snapshot(&self, record: BaseSnapshotRecord) -> StoreResult<()> {
        self.inner.write_base_snapshot(record).await?;
        self.persist()
    }

    async fn load_base_snapshot(
        &self,
        instance_id: &str,
    ) -> StoreResult<Option<BaseSnapshotRecord>> {
        self.inner.load_base_snapshot(instance_id).await
    }

    async fn append_message_event(&self, record: MessageEventRecord) -> StoreResult<()> {
        self.inner.append_message_event(record).await?;
        self.persist()
    }

    async fn load_message_events(
        &self,
        instance_id: &str,
    ) -> StoreResult<Vec<MessageEventRecord>> {
        self.inner.load_message_events(instance_id).await
    }

    async fn clear_message_events(&self, instance_id: &str) -> StoreResult<()> {
        self.inner.clear_message_events(instance_id).await?;
        self.persist()
    }

    async fn append_lifecycle(&self, record: LifecycleRecord) -> StoreResult<()> {
        self.inner.append_lifecycle(record).await?;
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PersistedEventType;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn reopening_store_recovers_snapshot_and_events() {
        let dir = tempdir().expect("tempdir");

        {
            let store = FsStateStore::new(dir.path()).expect("open");
            store
                .write_base_snapshot(BaseSnapshotRecord {
                    trace_id: "trace-1".to_string(),
                    instance_id: "inst-a".to_string(),
                    instance_key: "main".to_string(),
                    agent_name: "planner".to_string(),
                    turn_id: "turn-1".to_string(),
                    messages: vec![json!({ "role": "user" })],
                    source_event_count: 1,
                })
                .await
                .expect("write snapshot");
            store
                .append_message_event(MessageEventRecord {
                    trace_id: "trace-1".to_string(),
                    instance_id: "inst-a".to_string(),
                    turn_id: "turn-2".to_string(),
                    seq: 0,
                    event_type: PersistedEventType::SystemMessage,
                    payload: json!({ "content": "pending" }),
                    step_id: Some("step-1".to_string()),
                })
                .await
                .expect("append event");
        }

        let reopened = FsStateStore::new(dir.path()).expect("reopen");
        let snapshot = reopened
            .load_base_snapshot("inst-a")
            .await
            .expect("load")
            .expect("snapshot survives restart");
        assert_eq!(snapshot.turn_id, "turn-1");

        let events = reopened
            .load_message_events("inst-a")
            .await
            .expect("load events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, PersistedEventType::SystemMessage);
    }
}
