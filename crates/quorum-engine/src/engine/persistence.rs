//! Turn settlement and instance recovery.
//!
//! Settlement persists the turn's staged events, consolidates them into a
//! new base snapshot, clears the event log, and carries the consolidated
//! transcript forward as the instance history. Recovery inverts that: load
//! the latest snapshot, replay any unconsolidated events on top, consolidate.

use crate::EngineError;
use crate::messages::{Message, StagedEvent, fold};
use quorum_store::{BaseSnapshotRecord, MessageEventRecord};
use serde_json::Value;

use super::{AgentInstance, Turn, TurnEngine, TurnStatus};

impl TurnEngine {
    /// Persist the turn's message-state deltas and consolidate. Interrupted
    /// turns stage nothing and settle as a no-op.
    pub(super) async fn settle_turn(
        &self,
        instance: &mut AgentInstance,
        turn: &mut Turn,
    ) -> Result<(), EngineError> {
        if turn.status == TurnStatus::Interrupted || turn.message_state.events().is_empty() {
            return Ok(());
        }

        for staged in turn.message_state.events() {
            let payload = serde_json::to_value(&staged.event)
                .map_err(|error| EngineError::Serialization(error.to_string()))?;
            self.store
                .append_message_event(MessageEventRecord {
                    trace_id: turn.trace_id.clone(),
                    instance_id: instance.instance_id.clone(),
                    turn_id: turn.id.clone(),
                    seq: staged.seq,
                    event_type: staged.event.persisted_type(),
                    payload,
                    step_id: staged.step_id.clone(),
                })
                .await?;
        }

        let source_event_count = turn.message_state.fold_to_base();
        let messages = turn
            .message_state
            .base()
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Value>, _>>()
            .map_err(|error| EngineError::Serialization(error.to_string()))?;

        self.store
            .write_base_snapshot(BaseSnapshotRecord {
                trace_id: turn.trace_id.clone(),
                instance_id: instance.instance_id.clone(),
                instance_key: instance.instance_key.clone(),
                agent_name: instance.agent_name.clone(),
                turn_id: turn.id.clone(),
                messages,
                source_event_count,
            })
            .await?;
        self.store
            .clear_message_events(&instance.instance_id)
            .await?;

        instance.history = turn.message_state.base().to_vec();
        Ok(())
    }

    /// Rebuild an instance's history after a restart: latest snapshot plus
    /// any events that were persisted but never consolidated.
    pub async fn recover_instance(
        &self,
        instance: &mut AgentInstance,
    ) -> Result<(), EngineError> {
        let mut base: Vec<Message> = Vec::new();
        if let Some(snapshot) = self.store.load_base_snapshot(&instance.instance_id).await? {
            base = snapshot
                .messages
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<Message>, _>>()
                .map_err(|error| EngineError::Serialization(error.to_string()))?;
        }

        let records = self
            .store
            .load_message_events(&instance.instance_id)
            .await?;
        if !records.is_empty() {
            let staged = records
                .iter()
                .map(|record| {
                    serde_json::from_value(record.payload.clone())
                        .map(|event| StagedEvent {
                            seq: record.seq,
                            step_id: record.step_id.clone(),
                            event,
                        })
                        .map_err(|error| EngineError::Serialization(error.to_string()))
                })
                .collect::<Result<Vec<StagedEvent>, EngineError>>()?;
            base = fold(&base, &staged);
            self.store
                .clear_message_events(&instance.instance_id)
                .await?;
        }

        instance.history = base;
        Ok(())
    }
}
