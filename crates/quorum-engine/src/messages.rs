use quorum_llm::{ChatMessage, Role, ToolCall};
use quorum_store::PersistedEventType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::events::now_ms;

/// Provenance of one transcript message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageSource {
    User { source_name: String },
    Assistant { step_id: String },
    Tool { tool_call_id: String, tool_name: String },
    System,
    Extension { name: String },
}

/// Immutable transcript entry. Superseded only through message events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    pub created_at_ms: u64,
    pub source: MessageSource,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::build(Role::System, content.into(), MessageSource::System)
    }

    pub fn user(content: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self::build(
            Role::User,
            content.into(),
            MessageSource::User {
                source_name: source_name.into(),
            },
        )
    }

    pub fn assistant(
        content: impl Into<String>,
        step_id: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        let mut message = Self::build(
            Role::Assistant,
            content.into(),
            MessageSource::Assistant {
                step_id: step_id.into(),
            },
        );
        message.tool_calls = tool_calls;
        message
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let tool_call_id = tool_call_id.into();
        let mut message = Self::build(
            Role::Tool,
            content.into(),
            MessageSource::Tool {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.into(),
            },
        );
        message.tool_call_id = Some(tool_call_id);
        message
    }

    fn build(role: Role, content: String, source: MessageSource) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            metadata: BTreeMap::new(),
            created_at_ms: now_ms(),
            source,
        }
    }

    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
            tool_call_id: self.tool_call_id.clone(),
            tool_calls: self.tool_calls.clone(),
        }
    }
}

/// The sole mechanism by which the visible transcript changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MessageEvent {
    Append { message: Message },
    Replace { target_id: String, message: Message },
    Remove { target_id: String },
    Truncate,
    SystemMessage { message: Message },
}

impl MessageEvent {
    pub fn append(message: Message) -> Self {
        Self::Append { message }
    }

    pub fn system_message(message: Message) -> Self {
        Self::SystemMessage { message }
    }

    pub fn persisted_type(&self) -> PersistedEventType {
        match self {
            Self::Append { .. } => PersistedEventType::LlmMessage,
            Self::Replace { .. } => PersistedEventType::Replace,
            Self::Remove { .. } => PersistedEventType::Remove,
            Self::Truncate => PersistedEventType::Truncate,
            Self::SystemMessage { .. } => PersistedEventType::SystemMessage,
        }
    }
}

/// One staged event: the operation plus its position in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StagedEvent {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub event: MessageEvent,
}

/// Pure fold: copy the base, then apply events in ascending seq order.
///
/// replace on a missing target appends instead of failing, so a log written
/// before a compaction removed the target still replays. remove on a missing
/// target is a no-op. truncate drops everything accumulated so far,
/// including the base copy.
pub fn fold(base: &[Message], events: &[StagedEvent]) -> Vec<Message> {
    let mut ordered: Vec<&StagedEvent> = events.iter().collect();
    ordered.sort_by_key(|staged| staged.seq);

    let mut messages: Vec<Message> = base.to_vec();
    for staged in ordered {
        match &staged.event {
            MessageEvent::Append { message } | MessageEvent::SystemMessage { message } => {
                messages.push(message.clone());
            }
            MessageEvent::Replace { target_id, message } => {
                match messages.iter().rposition(|entry| entry.id == *target_id) {
                    Some(position) => messages[position] = message.clone(),
                    None => messages.push(message.clone()),
                }
            }
            MessageEvent::Remove { target_id } => {
                if let Some(position) = messages.iter().position(|entry| entry.id == *target_id) {
                    messages.remove(position);
                }
            }
            MessageEvent::Truncate => messages.clear(),
        }
    }
    messages
}

/// Event-sourced view of one turn's transcript.
///
/// `next` is derived state: it always equals `fold(base, events)` and is
/// recomputed on every apply, never mutated directly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnMessageState {
    base: Vec<Message>,
    events: Vec<StagedEvent>,
    next: Vec<Message>,
}

impl TurnMessageState {
    pub fn with_base(base: Vec<Message>) -> Self {
        let next = base.clone();
        Self {
            base,
            events: Vec::new(),
            next,
        }
    }

    pub fn base(&self) -> &[Message] {
        &self.base
    }

    pub fn events(&self) -> &[StagedEvent] {
        &self.events
    }

    pub fn next(&self) -> &[Message] {
        &self.next
    }

    /// Stage one event and recompute the derived view. Returns the seq
    /// assigned to the event.
    pub fn apply(&mut self, event: MessageEvent, step_id: Option<String>) -> u64 {
        let seq = self.events.len() as u64;
        self.events.push(StagedEvent {
            seq,
            step_id,
            event,
        });
        self.next = fold(&self.base, &self.events);
        seq
    }

    /// Consolidate: the current derived view becomes the base and the event
    /// log is cleared. Returns how many events were folded in.
    pub fn fold_to_base(&mut self) -> usize {
        let consolidated = self.events.len();
        self.base = std::mem::take(&mut self.next);
        self.events.clear();
        self.next = self.base.clone();
        consolidated
    }

    /// Install a recovered base, discarding any staged events.
    pub fn replace_base(&mut self, base: Vec<Message>) {
        self.base = base;
        self.events.clear();
        self.next = self.base.clone();
    }
}

/// Normalized inbound event as handed over by a connector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub source_kind: String,
    pub source_name: String,
    pub event_name: String,
    pub instance_key: String,
    pub text: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(seq: u64, event: MessageEvent) -> StagedEvent {
        StagedEvent {
            seq,
            step_id: None,
            event,
        }
    }

    #[test]
    fn fold_is_deterministic_and_idempotent() {
        let base = vec![Message::system("sys")];
        let events = vec![
            staged(0, MessageEvent::append(Message::user("hello", "cli"))),
            staged(
                1,
                MessageEvent::append(Message::assistant("hi", "step-1", vec![])),
            ),
        ];

        let first = fold(&base, &events);
        let second = fold(&base, &events);
        assert_eq!(first, second);
        assert_eq!(fold(&first, &[]), first);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn fold_applies_events_in_seq_order_regardless_of_append_order() {
        let m1 = Message::user("first", "cli");
        let m2 = Message::user("second", "cli");
        let events = vec![
            staged(1, MessageEvent::append(m2.clone())),
            staged(0, MessageEvent::append(m1.clone())),
        ];
        let folded = fold(&[], &events);
        assert_eq!(folded, vec![m1, m2]);
    }

    #[test]
    fn replace_miss_appends_instead_of_failing() {
        let replacement = Message::user("replacement", "cli");
        let events = vec![staged(
            0,
            MessageEvent::Replace {
                target_id: "missing".to_string(),
                message: replacement.clone(),
            },
        )];
        assert_eq!(fold(&[], &events), vec![replacement]);
    }

    #[test]
    fn replace_targets_last_match() {
        let mut original = Message::user("v1", "cli");
        original.id = "m-dup".to_string();
        let mut duplicate = Message::user("v2", "cli");
        duplicate.id = "m-dup".to_string();
        let mut replacement = Message::user("v3", "cli");
        replacement.id = "m-dup".to_string();

        let base = vec![original, duplicate];
        let events = vec![staged(
            0,
            MessageEvent::Replace {
                target_id: "m-dup".to_string(),
                message: replacement.clone(),
            },
        )];
        let folded = fold(&base, &events);
        assert_eq!(folded[0].content, "v1");
        assert_eq!(folded[1].content, "v3");
    }

    #[test]
    fn remove_miss_is_noop() {
        let base = vec![Message::system("sys")];
        let events = vec![staged(
            0,
            MessageEvent::Remove {
                target_id: "missing".to_string(),
            },
        )];
        assert_eq!(fold(&base, &events), base);
    }

    #[test]
    fn truncate_clears_accumulated_state() {
        let m1 = Message::system("m1");
        let m2 = Message::user("m2", "cli");
        let m3 = Message::user("m3", "cli");
        let events = vec![
            staged(0, MessageEvent::append(m2)),
            staged(1, MessageEvent::Truncate),
            staged(2, MessageEvent::append(m3.clone())),
        ];
        assert_eq!(fold(&[m1], &events), vec![m3]);
    }

    #[test]
    fn state_invariant_holds_across_apply_and_consolidation() {
        let mut state = TurnMessageState::with_base(vec![Message::system("sys")]);
        state.apply(MessageEvent::append(Message::user("hi", "cli")), None);
        assert_eq!(state.next(), fold(state.base(), state.events()).as_slice());

        let consolidated = state.fold_to_base();
        assert_eq!(consolidated, 1);
        assert_eq!(state.events().len(), 0);
        assert_eq!(state.base().len(), 2);
        assert_eq!(state.next(), state.base());
    }

    #[test]
    fn replace_base_discards_staged_events() {
        let mut state = TurnMessageState::with_base(vec![]);
        state.apply(MessageEvent::append(Message::user("stale", "cli")), None);

        let recovered = vec![Message::system("recovered")];
        state.replace_base(recovered.clone());
        assert_eq!(state.base(), recovered.as_slice());
        assert_eq!(state.next(), recovered.as_slice());
        assert!(state.events().is_empty());
    }
}
