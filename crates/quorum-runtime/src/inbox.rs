//! Async reply inbox.
//!
//! Replies to async requests land here, keyed by the requesting agent's
//! address, and are drained into synthetic transcript messages at the start
//! of the requester's next turn. Each requester's inbox is bounded; a full
//! inbox drops the incoming entry rather than evicting older ones, since the
//! older entries are the ones a stalled agent has been waiting longest to
//! see.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

pub const MAX_INBOX_ENTRIES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboxStatus {
    Ok,
    Error,
    Timeout,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxEntry {
    pub status: InboxStatus,
    pub request_id: String,
    pub target: String,
    pub trace_id: String,
    pub payload: Value,
}

#[derive(Default)]
pub struct AsyncInbox {
    entries: Mutex<HashMap<String, Vec<InboxEntry>>>,
}

impl AsyncInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the requester's inbox is full and the entry was
    /// dropped; the caller emits the warning.
    pub fn push(&self, requester: &str, entry: InboxEntry) -> bool {
        let Ok(mut map) = self.entries.lock() else {
            return false;
        };
        let inbox = map.entry(requester.to_string()).or_default();
        if inbox.len() >= MAX_INBOX_ENTRIES {
            return false;
        }
        inbox.push(entry);
        true
    }

    /// Take everything queued for a requester, oldest first.
    pub fn drain(&self, requester: &str) -> Vec<InboxEntry> {
        self.entries
            .lock()
            .ok()
            .and_then(|mut map| map.remove(requester))
            .unwrap_or_default()
    }

    pub fn pending_for(&self, requester: &str) -> usize {
        self.entries
            .lock()
            .ok()
            .and_then(|map| map.get(requester).map(Vec::len))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(request_id: &str) -> InboxEntry {
        InboxEntry {
            status: InboxStatus::Ok,
            request_id: request_id.to_string(),
            target: "worker@main".to_string(),
            trace_id: "trace-1".to_string(),
            payload: json!("done"),
        }
    }

    #[test]
    fn drain_returns_entries_in_arrival_order_and_empties() {
        let inbox = AsyncInbox::new();
        assert!(inbox.push("planner@main", entry("req-1")));
        assert!(inbox.push("planner@main", entry("req-2")));

        let drained = inbox.drain("planner@main");
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].request_id, "req-1");
        assert_eq!(drained[1].request_id, "req-2");
        assert_eq!(inbox.pending_for("planner@main"), 0);
    }

    #[test]
    fn full_inbox_drops_the_new_entry() {
        let inbox = AsyncInbox::new();
        for index in 0..MAX_INBOX_ENTRIES {
            assert!(inbox.push("planner@main", entry(&format!("req-{index}"))));
        }
        assert!(!inbox.push("planner@main", entry("req-overflow")));

        let drained = inbox.drain("planner@main");
        assert_eq!(drained.len(), MAX_INBOX_ENTRIES);
        assert!(drained.iter().all(|e| e.request_id != "req-overflow"));
    }

    #[test]
    fn inboxes_are_isolated_per_requester() {
        let inbox = AsyncInbox::new();
        inbox.push("a@main", entry("req-1"));
        inbox.push("b@main", entry("req-2"));
        assert_eq!(inbox.drain("a@main").len(), 1);
        assert_eq!(inbox.pending_for("b@main"), 1);
    }
}
