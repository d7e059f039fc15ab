//! Multi-agent supervisor.
//!
//! Registers agent definitions, spawns one process per (agent, instance key),
//! and routes envelopes. Event envelopes go to the target's serial queue;
//! reply envelopes short-circuit into the pending map so a requester is
//! answered even while the target of its next request is busy.

use quorum_engine::events::{EventEmitter, EventKind, NoopEventEmitter, RuntimeEvent};
use quorum_engine::link::{
    AgentCatalogEntry, AgentErrorCode, AgentLink, AgentRequestError, AgentSummary, RequestOptions,
    RequestReply, SpawnOptions, SpawnOutcome,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;

use crate::envelope::{AgentCallPayload, CallKind, IpcEnvelope};
use crate::inbox::{AsyncInbox, InboxEntry, InboxStatus};
use crate::link::{CallScope, ProcessLink};
use crate::pending::{AsyncCompletion, PendingMap};
use crate::process::{ProcessHandle, spawn_process};

pub const DEFAULT_INSTANCE_KEY: &str = "main";

/// Builds one engine per process. The link handed in is that process's
/// [`ProcessLink`]; factories wire it into the engine so tools can reach
/// other agents.
pub type AgentFactory =
    Arc<dyn Fn(Arc<dyn AgentLink>) -> quorum_engine::TurnEngine + Send + Sync>;

pub struct AgentDefinition {
    pub name: String,
    pub description: String,
    pub factory: AgentFactory,
}

/// `"name"` or `"name@key"`, defaulting the key.
pub fn parse_target(target: &str) -> (String, String) {
    match target.split_once('@') {
        Some((name, key)) if !key.is_empty() => (name.to_string(), key.to_string()),
        Some((name, _)) => (name.to_string(), DEFAULT_INSTANCE_KEY.to_string()),
        None => (target.to_string(), DEFAULT_INSTANCE_KEY.to_string()),
    }
}

pub fn format_address(name: &str, key: &str) -> String {
    format!("{name}@{key}")
}

pub(crate) struct RuntimeInner {
    agents: HashMap<String, AgentDefinition>,
    processes: Mutex<HashMap<String, ProcessHandle>>,
    pub(crate) pending: Arc<PendingMap>,
    pub(crate) inbox: Arc<AsyncInbox>,
    pub(crate) emitter: Arc<dyn EventEmitter>,
}

impl RuntimeInner {
    pub(crate) fn spawn_instance(
        self: &Arc<Self>,
        target: &str,
        options: SpawnOptions,
    ) -> Result<SpawnOutcome, AgentRequestError> {
        let (name, parsed_key) = parse_target(target);
        let key = options.instance_key.clone().unwrap_or(parsed_key);
        let definition = self
            .agents
            .get(&name)
            .ok_or_else(|| AgentRequestError::not_found(&name))?;
        let address = format_address(&name, &key);

        let mut processes = self
            .processes
            .lock()
            .map_err(|_| AgentRequestError::delivery_failed("process table mutex poisoned"))?;

        if let Some(existing) = processes.get(&address) {
            // Spawn is idempotent; a provided cwd still updates the record.
            existing.set_cwd(options.cwd.clone());
            return Ok(SpawnOutcome {
                target: address,
                instance_key: key,
                spawned: false,
                cwd: existing.cwd(),
            });
        }

        let scope: Arc<Mutex<CallScope>> = Arc::new(Mutex::new(CallScope::default()));
        let link: Arc<dyn AgentLink> = Arc::new(ProcessLink::new(
            Arc::downgrade(self),
            address.clone(),
            scope.clone(),
        ));
        let engine = (definition.factory)(link);
        let handle = spawn_process(
            Arc::downgrade(self),
            engine,
            scope,
            name,
            key.clone(),
            options.cwd.clone(),
        );
        let cwd = handle.cwd();
        processes.insert(address.clone(), handle);

        Ok(SpawnOutcome {
            target: address,
            instance_key: key,
            spawned: true,
            cwd,
        })
    }

    /// Route one envelope. Replies resolve the pending map directly; events
    /// queue on the target process. A full queue fails fast instead of
    /// blocking the caller past its deadline. A dead target fails every
    /// request pending against it.
    pub(crate) async fn deliver(
        self: &Arc<Self>,
        envelope: IpcEnvelope,
    ) -> Result<(), AgentRequestError> {
        if let Some(payload) = envelope.payload.as_ref() {
            if payload.is_reply() {
                self.route_reply(payload.clone());
                return Ok(());
            }
        }

        let tx = {
            let processes = self
                .processes
                .lock()
                .map_err(|_| AgentRequestError::delivery_failed("process table mutex poisoned"))?;
            processes
                .get(&envelope.to)
                .map(|handle| handle.tx.clone())
                .ok_or_else(|| AgentRequestError::not_found(&envelope.to))?
        };

        let target = envelope.to.clone();
        match tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(AgentRequestError::delivery_failed(format!(
                "process '{target}' queue is full"
            ))),
            Err(TrySendError::Closed(_)) => {
                self.retire_process(&target);
                Err(AgentRequestError::delivery_failed(format!(
                    "process '{target}' exited before delivery"
                )))
            }
        }
    }

    fn route_reply(self: &Arc<Self>, payload: AgentCallPayload) {
        let Some(request_id) = payload.in_reply_to().map(str::to_string) else {
            let _ = self.emitter.emit(RuntimeEvent::warning(
                payload.trace_id.clone(),
                "reply without inReplyTo metadata dropped",
            ));
            return;
        };

        let outcome = match payload.kind {
            CallKind::ErrorResponse => {
                let code = payload
                    .error_code()
                    .and_then(AgentErrorCode::parse)
                    .unwrap_or(AgentErrorCode::IpcDeliveryFailed);
                let message = payload
                    .error_message()
                    .unwrap_or("remote agent reported an error")
                    .to_string();
                Err(AgentRequestError::new(code, message))
            }
            _ => Ok(payload.input.clone()),
        };

        let _ = self.emitter.emit(
            RuntimeEvent::new(EventKind::RequestResolved, payload.trace_id.clone())
                .with("requestId", request_id.as_str())
                .with("isError", outcome.is_err()),
        );

        if let Some(completion) = self.pending.resolve(&request_id, outcome) {
            self.deliver_completion(completion);
        }
    }

    /// Turn an async completion into an inbox entry for its requester.
    pub(crate) fn deliver_completion(self: &Arc<Self>, completion: AsyncCompletion) {
        let (status, payload) = match &completion.outcome {
            Ok(value) => (InboxStatus::Ok, value.clone()),
            Err(error) if error.code == AgentErrorCode::AgentRequestTimeout => (
                InboxStatus::Timeout,
                json!({ "code": error.code.as_str(), "message": error.message }),
            ),
            Err(error) => (
                InboxStatus::Error,
                json!({ "code": error.code.as_str(), "message": error.message }),
            ),
        };
        let entry = InboxEntry {
            status,
            request_id: completion.request_id.clone(),
            target: completion.target.clone(),
            trace_id: completion.trace_id.clone(),
            payload,
        };

        if self.inbox.push(&completion.requester, entry) {
            let _ = self.emitter.emit(
                RuntimeEvent::new(EventKind::InboxDelivered, completion.trace_id)
                    .with("requester", completion.requester.as_str())
                    .with("requestId", completion.request_id.as_str()),
            );
        } else {
            let _ = self.emitter.emit(RuntimeEvent::warning(
                completion.trace_id,
                format!(
                    "inbox for '{}' is full; reply to request '{}' dropped",
                    completion.requester, completion.request_id
                ),
            ));
        }
    }

    fn retire_process(self: &Arc<Self>, address: &str) {
        if let Ok(mut processes) = self.processes.lock() {
            if let Some(handle) = processes.remove(address) {
                handle.task.abort();
            }
        }
        let completions = self.pending.fail_target(
            address,
            AgentRequestError::delivery_failed(format!("process '{address}' exited")),
        );
        for completion in completions {
            self.deliver_completion(completion);
        }
    }

    pub(crate) fn list(&self) -> Vec<AgentSummary> {
        let Ok(processes) = self.processes.lock() else {
            return Vec::new();
        };
        let mut summaries: Vec<AgentSummary> = processes
            .values()
            .map(|handle| AgentSummary {
                agent_name: handle.agent_name.clone(),
                instance_key: handle.instance_key.clone(),
                status: "running".to_string(),
            })
            .collect();
        summaries.sort_by(|a, b| {
            (a.agent_name.as_str(), a.instance_key.as_str())
                .cmp(&(b.agent_name.as_str(), b.instance_key.as_str()))
        });
        summaries
    }

    pub(crate) fn catalog(&self) -> Vec<AgentCatalogEntry> {
        let mut entries: Vec<AgentCatalogEntry> = self
            .agents
            .values()
            .map(|definition| AgentCatalogEntry {
                name: definition.name.clone(),
                description: definition.description.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

/// The embedder-facing runtime: registered agents plus the routing fabric.
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

impl AgentRuntime {
    pub fn new(definitions: Vec<AgentDefinition>) -> Self {
        Self::with_emitter(definitions, Arc::new(NoopEventEmitter))
    }

    pub fn with_emitter(
        definitions: Vec<AgentDefinition>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        let agents = definitions
            .into_iter()
            .map(|definition| (definition.name.clone(), definition))
            .collect();
        Self {
            inner: Arc::new(RuntimeInner {
                agents,
                processes: Mutex::new(HashMap::new()),
                pending: Arc::new(PendingMap::new()),
                inbox: Arc::new(AsyncInbox::new()),
                emitter,
            }),
        }
    }

    pub fn spawn(
        &self,
        target: &str,
        options: SpawnOptions,
    ) -> Result<SpawnOutcome, AgentRequestError> {
        self.inner.spawn_instance(target, options)
    }

    /// Synchronous or async request from outside the agent fabric, e.g. a
    /// connector or CLI. The external caller participates in cycle detection
    /// under a reserved address.
    pub async fn request(
        &self,
        target: &str,
        input: Value,
        options: RequestOptions,
    ) -> Result<RequestReply, AgentRequestError> {
        self.external_link().request(target, input, options).await
    }

    pub async fn send(&self, target: &str, input: Value) -> Result<(), AgentRequestError> {
        self.external_link().send(target, input).await
    }

    pub fn list(&self) -> Vec<AgentSummary> {
        self.inner.list()
    }

    pub fn catalog(&self) -> Vec<AgentCatalogEntry> {
        self.inner.catalog()
    }

    /// Drain and stop every process: each gets a shutdown signal, finishes
    /// its current turn plus anything already queued, and acks before its
    /// task is reaped. Outstanding requests fail rather than hang.
    pub async fn shutdown(&self) {
        let handles: Vec<ProcessHandle> = {
            let Ok(mut processes) = self.inner.processes.lock() else {
                return;
            };
            processes.drain().map(|(_, handle)| handle).collect()
        };

        for handle in &handles {
            let _ = handle.shutdown.send(true);
        }
        for mut handle in handles {
            if let Some(ack) = handle.ack.take() {
                let _ = tokio::time::timeout(Duration::from_secs(5), ack).await;
            }
            handle.task.abort();
            let _ = handle.task.await;
        }

        self.inner.pending.dispose();
    }

    fn external_link(&self) -> ProcessLink {
        ProcessLink::new(
            Arc::downgrade(&self.inner),
            "external@supervisor",
            Arc::new(Mutex::new(CallScope::default())),
        )
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }
}
