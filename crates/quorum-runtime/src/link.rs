//! The engine-facing side of inter-agent messaging.
//!
//! One [`ProcessLink`] is created per agent process and handed to the engine
//! factory, so tool handlers reach other agents through it. Cycle detection
//! is synchronous and caller-side: the link refuses a request whose target is
//! already on the current call stack, before anything is queued.

use async_trait::async_trait;
use quorum_engine::link::{
    AgentCatalogEntry, AgentLink, AgentRequestError, AgentSummary, RequestOptions, RequestReply,
    SpawnOptions, SpawnOutcome,
};
use quorum_engine::events::{EventKind, RuntimeEvent};
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use uuid::Uuid;

use crate::envelope::{AgentCallPayload, CallSource, IpcEnvelope};
use crate::supervisor::{RuntimeInner, format_address, parse_target};

/// Identity of the turn currently running in a process. The process loop
/// installs the incoming payload's call stack, trace id, and auth before the
/// turn and clears them after, so outbound calls made by tools inherit the
/// originating turn's identity instead of minting their own.
#[derive(Default)]
pub(crate) struct CallScope {
    pub(crate) stack: Vec<String>,
    pub(crate) trace_id: Option<String>,
    pub(crate) auth: Option<Value>,
}

pub struct ProcessLink {
    inner: Weak<RuntimeInner>,
    address: String,
    scope: Arc<Mutex<CallScope>>,
}

impl ProcessLink {
    pub(crate) fn new(
        inner: Weak<RuntimeInner>,
        address: impl Into<String>,
        scope: Arc<Mutex<CallScope>>,
    ) -> Self {
        Self {
            inner,
            address: address.into(),
            scope,
        }
    }

    fn runtime(&self) -> Result<Arc<RuntimeInner>, AgentRequestError> {
        self.inner
            .upgrade()
            .ok_or_else(|| AgentRequestError::delivery_failed("runtime has shut down"))
    }

    /// Current synchronous path, this agent last.
    fn visited(&self) -> Vec<String> {
        let mut visited = self
            .scope
            .lock()
            .map(|scope| scope.stack.clone())
            .unwrap_or_default();
        visited.push(self.address.clone());
        visited
    }

    /// Trace id and auth of the ambient turn; a fresh trace when there is
    /// none, e.g. an external caller.
    fn turn_identity(&self) -> (String, Option<Value>) {
        let (trace_id, auth) = self
            .scope
            .lock()
            .map(|scope| (scope.trace_id.clone(), scope.auth.clone()))
            .unwrap_or((None, None));
        (
            trace_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            auth,
        )
    }

    fn request_payload(&self, input: Value, key: String, visited: Vec<String>) -> AgentCallPayload {
        let (trace_id, auth) = self.turn_identity();
        let mut payload = AgentCallPayload::request(
            input,
            self.source(),
            self.address.clone(),
            key,
            trace_id,
            visited,
        );
        payload.auth = auth;
        payload
    }

    fn source(&self) -> CallSource {
        CallSource {
            kind: "agent".to_string(),
            name: self.address.clone(),
        }
    }
}

#[async_trait]
impl AgentLink for ProcessLink {
    async fn request(
        &self,
        target: &str,
        input: Value,
        options: RequestOptions,
    ) -> Result<RequestReply, AgentRequestError> {
        let runtime = self.runtime()?;
        let (name, key) = parse_target(target);
        let address = format_address(&name, &key);

        let visited = self.visited();
        if visited.contains(&address) {
            return Err(AgentRequestError::circular(&visited, &address));
        }

        let payload = self.request_payload(input, key, visited);
        let trace_id = payload.trace_id.clone();
        let request_id = payload.id.clone();

        let _ = runtime.emitter.emit(
            RuntimeEvent::new(EventKind::RequestRegistered, &trace_id)
                .with("requestId", request_id.as_str())
                .with("from", self.address.as_str())
                .with("to", address.as_str())
                .with("async", options.async_mode),
        );

        if options.async_mode {
            runtime.pending.register_async(&request_id, &address, &self.address, &trace_id)?;
            if let Err(error) = runtime
                .deliver(IpcEnvelope::event(self.address.clone(), address.clone(), payload))
                .await
            {
                runtime.pending.forget(&request_id);
                return Err(error);
            }

            // Exactly one timeout entry: whichever of the timer and the real
            // reply resolves the pending entry first wins.
            let timer_runtime = self.inner.clone();
            let timer_id = request_id.clone();
            let timer_address = address.clone();
            let timeout_ms = options.timeout_ms;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                let Some(runtime) = timer_runtime.upgrade() else {
                    return;
                };
                let timed_out = runtime.pending.resolve(
                    &timer_id,
                    Err(AgentRequestError::timeout(&timer_address, timeout_ms)),
                );
                if let Some(completion) = timed_out {
                    runtime.deliver_completion(completion);
                }
            });
            return Ok(RequestReply::Queued { request_id });
        }

        let reply_rx = runtime.pending.register_sync(&request_id, &address)?;
        if let Err(error) = runtime
            .deliver(IpcEnvelope::event(self.address.clone(), address.clone(), payload))
            .await
        {
            runtime.pending.forget(&request_id);
            return Err(error);
        }

        match tokio::time::timeout(Duration::from_millis(options.timeout_ms), reply_rx).await {
            Ok(Ok(outcome)) => outcome.map(RequestReply::Completed),
            Ok(Err(_closed)) => Err(AgentRequestError::delivery_failed(
                "reply channel closed before a response arrived",
            )),
            Err(_elapsed) => {
                runtime.pending.forget(&request_id);
                Err(AgentRequestError::timeout(&address, options.timeout_ms))
            }
        }
    }

    async fn send(&self, target: &str, input: Value) -> Result<(), AgentRequestError> {
        let runtime = self.runtime()?;
        let (name, key) = parse_target(target);
        let address = format_address(&name, &key);
        let (trace_id, auth) = self.turn_identity();
        let mut payload = AgentCallPayload::notification(input, self.source(), key, trace_id);
        payload.auth = auth;
        runtime
            .deliver(IpcEnvelope::event(self.address.clone(), address, payload))
            .await
    }

    async fn spawn(
        &self,
        target: &str,
        options: SpawnOptions,
    ) -> Result<SpawnOutcome, AgentRequestError> {
        self.runtime()?.spawn_instance(target, options)
    }

    async fn list(&self) -> Result<Vec<AgentSummary>, AgentRequestError> {
        Ok(self.runtime()?.list())
    }

    async fn catalog(&self) -> Result<Vec<AgentCatalogEntry>, AgentRequestError> {
        Ok(self.runtime()?.catalog())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_requests_inherit_the_turn_identity() {
        let scope = Arc::new(Mutex::new(CallScope {
            stack: vec!["a@main".to_string()],
            trace_id: Some("trace-outer".to_string()),
            auth: Some(json!({ "subject": "user-1" })),
        }));
        let link = ProcessLink::new(Weak::new(), "b@main", scope);

        let payload = link.request_payload(json!("hi"), "main".to_string(), link.visited());
        assert_eq!(payload.trace_id, "trace-outer");
        assert_eq!(payload.auth, Some(json!({ "subject": "user-1" })));
        assert_eq!(
            payload.call_stack,
            vec!["a@main".to_string(), "b@main".to_string()]
        );
    }

    #[test]
    fn requests_without_an_ambient_turn_mint_a_trace() {
        let link = ProcessLink::new(
            Weak::new(),
            "external@supervisor",
            Arc::new(Mutex::new(CallScope::default())),
        );

        let payload = link.request_payload(json!("hi"), "main".to_string(), link.visited());
        assert!(!payload.trace_id.is_empty());
        assert!(payload.auth.is_none());
    }
}
