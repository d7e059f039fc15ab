use crate::store::{StateStore, StoreError, StoreResult};
use crate::types::{BaseSnapshotRecord, LifecycleRecord, MessageEventRecord};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct MemoryState {
    pub snapshots: Vec<BaseSnapshotRecord>,
    pub events: BTreeMap<String, Vec<MessageEventRecord>>,
    pub lifecycle: Vec<LifecycleRecord>,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_state(state: MemoryState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn snapshot(&self) -> StoreResult<MemoryState> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory state store mutex poisoned".to_string()))
    }

    /// Lifecycle rows written so far. Test hook; the engine never reads these.
    pub fn lifecycle_rows(&self) -> StoreResult<Vec<LifecycleRecord>> {
        Ok(self.lock()?.lifecycle.clone())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn write_base_snapshot(&self, record: BaseSnapshotRecord) -> StoreResult<()> {
        self.lock()?.snapshots.push(record);
        Ok(())
    }

    async fn load_base_snapshot(
        &self,
        instance_id: &str,
    ) -> StoreResult<Option<BaseSnapshotRecord>> {
        let state = self.lock()?;
        Ok(state
            .snapshots
            .iter()
            .rev()
            .find(|record| record.instance_id == instance_id)
            .cloned())
    }

    async fn append_message_event(&self, record: MessageEventRecord) -> StoreResult<()> {
        let mut state = self.lock()?;
        state
            .events
            .entry(record.instance_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn load_message_events(
        &self,
        instance_id: &str,
    ) -> StoreResult<Vec<MessageEventRecord>> {
        let state = self.lock()?;
        let mut events = state.events.get(instance_id).cloned().unwrap_or_default();
        events.sort_by_key(|record| record.seq);
        Ok(events)
    }

    async fn clear_message_events(&self, instance_id: &str) -> StoreResult<()> {
        self.lock()?.events.remove(instance_id);
        Ok(())
    }

    async fn append_lifecycle(&self, record: LifecycleRecord) -> StoreResult<()> {
        self.lock()?.lifecycle.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PersistedEventType;
    use serde_json::json;

    fn event(instance: &str, seq: u64) -> MessageEventRecord {
        MessageEventRecord {
            trace_id: "trace-1".to_string(),
            instance_id: instance.to_string(),
            turn_id: "turn-1".to_string(),
            seq,
            event_type: PersistedEventType::LlmMessage,
            payload: json!({ "seq": seq }),
            step_id: None,
        }
    }

    #[tokio::test]
    async fn latest_snapshot_wins_per_instance() {
        let store = MemoryStateStore::new();
        for turn in ["turn-1", "turn-2"] {
            store
                .write_base_snapshot(BaseSnapshotRecord {
                    trace_id: "trace-1".to_string(),
                    instance_id: "inst-a".to_string(),
                    instance_key: "main".to_string(),
                    agent_name: "planner".to_string(),
                    turn_id: turn.to_string(),
                    messages: vec![],
                    source_event_count: 0,
                })
                .await
                .expect("write snapshot");
        }

        let loaded = store
            .load_base_snapshot("inst-a")
            .await
            .expect("load")
            .expect("snapshot present");
        assert_eq!(loaded.turn_id, "turn-2");
        assert!(
            store
                .load_base_snapshot("inst-b")
                .await
                .expect("load")
                .is_none()
        );
    }

    #[tokio::test]
    async fn events_return_in_seq_order_and_clear() {
        let store = MemoryStateStore::new();
        for seq in [2, 0, 1] {
            store
                .append_message_event(event("inst-a", seq))
                .await
                .expect("append");
        }

        let events = store.load_message_events("inst-a").await.expect("load");
        let seqs: Vec<u64> = events.iter().map(|record| record.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        store
            .clear_message_events("inst-a")
            .await
            .expect("clear");
        assert!(
            store
                .load_message_events("inst-a")
                .await
                .expect("load")
                .is_empty()
        );
    }
}
