//! In-flight request tracking.
//!
//! Every outbound request registers here before dispatch, keyed by request
//! id. Synchronous requesters park on a oneshot; async requesters leave a
//! record that routes the eventual reply into their inbox. The map is
//! bounded: stale entries are evicted first, and registration is rejected
//! once the cap is reached so a misbehaving agent cannot grow it without
//! bound.

use quorum_engine::link::{AgentErrorCode, AgentRequestError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

pub const MAX_PENDING_REQUESTS: usize = 100;
pub const STALE_AFTER: Duration = Duration::from_secs(60);

pub type ReplyResult = Result<Value, AgentRequestError>;

enum PendingKind {
    Sync(oneshot::Sender<ReplyResult>),
    Async {
        requester: String,
        trace_id: String,
    },
}

struct PendingEntry {
    kind: PendingKind,
    target: String,
    registered_at: Instant,
}

/// What to do with a reply that matched an async registration.
#[derive(Clone, Debug, PartialEq)]
pub struct AsyncCompletion {
    pub requester: String,
    pub request_id: String,
    pub target: String,
    pub trace_id: String,
    pub outcome: ReplyResult,
}

#[derive(Default)]
pub struct PendingMap {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a synchronous request. The caller awaits the returned
    /// receiver; a dropped receiver simply discards the eventual reply.
    pub fn register_sync(
        &self,
        request_id: &str,
        target: &str,
    ) -> Result<oneshot::Receiver<ReplyResult>, AgentRequestError> {
        let (tx, rx) = oneshot::channel();
        self.register(
            request_id,
            PendingEntry {
                kind: PendingKind::Sync(tx),
                target: target.to_string(),
                registered_at: Instant::now(),
            },
        )?;
        Ok(rx)
    }

    pub fn register_async(
        &self,
        request_id: &str,
        target: &str,
        requester: &str,
        trace_id: &str,
    ) -> Result<(), AgentRequestError> {
        self.register(
            request_id,
            PendingEntry {
                kind: PendingKind::Async {
                    requester: requester.to_string(),
                    trace_id: trace_id.to_string(),
                },
                target: target.to_string(),
                registered_at: Instant::now(),
            },
        )
    }

    fn register(&self, request_id: &str, entry: PendingEntry) -> Result<(), AgentRequestError> {
        let mut map = self.lock()?;

        // Stale entries get a timeout outcome on their way out.
        let now = Instant::now();
        let stale: Vec<String> = map
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.registered_at) >= STALE_AFTER)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(entry) = map.remove(&id) {
                let error =
                    AgentRequestError::timeout(&entry.target, STALE_AFTER.as_millis() as u64);
                if let PendingKind::Sync(tx) = entry.kind {
                    let _ = tx.send(Err(error));
                }
            }
        }

        if map.len() >= MAX_PENDING_REQUESTS {
            return Err(AgentRequestError::delivery_failed(
                "pending request limit reached",
            ));
        }
        map.insert(request_id.to_string(), entry);
        Ok(())
    }

    /// Resolve one request. Sync entries are completed directly; async
    /// entries come back as an [`AsyncCompletion`] for inbox delivery.
    /// Unknown ids (already timed out, already resolved) return `None`.
    pub fn resolve(&self, request_id: &str, outcome: ReplyResult) -> Option<AsyncCompletion> {
        let entry = self.lock().ok()?.remove(request_id)?;
        match entry.kind {
            PendingKind::Sync(tx) => {
                let _ = tx.send(outcome);
                None
            }
            PendingKind::Async {
                requester,
                trace_id,
            } => Some(AsyncCompletion {
                requester,
                request_id: request_id.to_string(),
                target: entry.target,
                trace_id,
                outcome,
            }),
        }
    }

    /// Drop a registration without resolving it, e.g. after a sync timeout.
    pub fn forget(&self, request_id: &str) -> bool {
        self.lock()
            .map(|mut map| map.remove(request_id).is_some())
            .unwrap_or(false)
    }

    /// Fail every request targeted at a dead process.
    pub fn fail_target(&self, target: &str, error: AgentRequestError) -> Vec<AsyncCompletion> {
        let Ok(mut map) = self.lock() else {
            return Vec::new();
        };
        let ids: Vec<String> = map
            .iter()
            .filter(|(_, entry)| entry.target == target)
            .map(|(id, _)| id.clone())
            .collect();
        let mut completions = Vec::new();
        for id in ids {
            if let Some(entry) = map.remove(&id) {
                match entry.kind {
                    PendingKind::Sync(tx) => {
                        let _ = tx.send(Err(error.clone()));
                    }
                    PendingKind::Async {
                        requester,
                        trace_id,
                    } => completions.push(AsyncCompletion {
                        requester,
                        request_id: id,
                        target: entry.target,
                        trace_id,
                        outcome: Err(error.clone()),
                    }),
                }
            }
        }
        completions
    }

    /// Fail everything; used at runtime shutdown.
    pub fn dispose(&self) {
        let Ok(mut map) = self.lock() else {
            return;
        };
        for (_, entry) in map.drain() {
            if let PendingKind::Sync(tx) = entry.kind {
                let _ = tx.send(Err(AgentRequestError::new(
                    AgentErrorCode::IpcDeliveryFailed,
                    "runtime is shutting down",
                )));
            }
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, PendingEntry>>, AgentRequestError> {
        self.entries
            .lock()
            .map_err(|_| AgentRequestError::delivery_failed("pending map mutex poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn sync_entry_resolves_through_the_oneshot() {
        let pending = PendingMap::new();
        let rx = pending
            .register_sync("req-1", "worker@main")
            .expect("register");
        assert!(pending.resolve("req-1", Ok(json!("done"))).is_none());
        assert_eq!(rx.await.expect("reply"), Ok(json!("done")));
        assert!(pending.is_empty());
    }

    #[test]
    fn async_entry_resolves_to_a_completion() {
        let pending = PendingMap::new();
        pending
            .register_async("req-1", "worker@main", "planner@main", "trace-1")
            .expect("register");
        let completion = pending
            .resolve("req-1", Ok(json!(42)))
            .expect("async completion");
        assert_eq!(completion.requester, "planner@main");
        assert_eq!(completion.request_id, "req-1");
        assert_eq!(completion.outcome, Ok(json!(42)));
    }

    #[test]
    fn unknown_request_resolves_to_nothing() {
        let pending = PendingMap::new();
        assert!(pending.resolve("ghost", Ok(json!(null))).is_none());
    }

    #[test]
    fn registration_is_rejected_at_the_cap() {
        let pending = PendingMap::new();
        for index in 0..MAX_PENDING_REQUESTS {
            pending
                .register_async(&format!("req-{index}"), "worker@main", "a@main", "t")
                .expect("register under cap");
        }
        let error = pending
            .register_async("req-overflow", "worker@main", "a@main", "t")
            .expect_err("over the cap");
        assert_eq!(error.code, AgentErrorCode::IpcDeliveryFailed);
        assert!(error.message.contains("pending request limit"));
    }

    #[test]
    fn fail_target_only_touches_matching_entries() {
        let pending = PendingMap::new();
        pending
            .register_async("req-1", "worker@main", "a@main", "t")
            .expect("register");
        pending
            .register_async("req-2", "other@main", "a@main", "t")
            .expect("register");

        let completions = pending.fail_target(
            "worker@main",
            AgentRequestError::delivery_failed("target exited"),
        );
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].request_id, "req-1");
        assert_eq!(pending.len(), 1);
    }
}
