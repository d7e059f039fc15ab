//! One agent instance, one serial process.
//!
//! A process owns its engine and instance state and consumes envelopes from
//! a bounded queue strictly in order, so an instance never runs two turns
//! concurrently. Replies never enter this queue; the supervisor resolves
//! them against the pending map directly, which is what lets a busy agent's
//! outstanding requests complete while it is mid-turn.

use quorum_engine::engine::{AgentInstance, TurnInput};
use quorum_engine::events::{EventKind, RuntimeEvent};
use quorum_engine::messages::{InboundEvent, Message, MessageEvent};
use quorum_engine::TurnEngine;
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::envelope::{AgentCallPayload, CallKind, CallSource, EnvelopeKind, IpcEnvelope};
use crate::inbox::{InboxEntry, InboxStatus};
use crate::link::CallScope;
use crate::supervisor::RuntimeInner;

pub(crate) const PROCESS_QUEUE_DEPTH: usize = 64;

pub(crate) struct ProcessHandle {
    pub(crate) tx: mpsc::Sender<IpcEnvelope>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) ack: Option<oneshot::Receiver<IpcEnvelope>>,
    pub(crate) task: JoinHandle<()>,
    pub(crate) agent_name: String,
    pub(crate) instance_key: String,
    pub(crate) cwd: Mutex<Option<String>>,
}

pub(crate) fn spawn_process(
    runtime: Weak<RuntimeInner>,
    engine: TurnEngine,
    scope: Arc<Mutex<CallScope>>,
    agent_name: String,
    instance_key: String,
    cwd: Option<String>,
) -> ProcessHandle {
    let (tx, rx) = mpsc::channel(PROCESS_QUEUE_DEPTH);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (ack_tx, ack_rx) = oneshot::channel();

    let address = crate::supervisor::format_address(&agent_name, &instance_key);
    let process = AgentProcess {
        runtime,
        engine,
        scope,
        address: address.clone(),
    };
    let task = tokio::spawn(process.run(
        AgentInstance::new(agent_name.clone(), instance_key.clone()),
        rx,
        shutdown_rx,
        ack_tx,
    ));

    ProcessHandle {
        tx,
        shutdown: shutdown_tx,
        ack: Some(ack_rx),
        task,
        agent_name,
        instance_key,
        cwd: Mutex::new(cwd),
    }
}

struct AgentProcess {
    runtime: Weak<RuntimeInner>,
    engine: TurnEngine,
    scope: Arc<Mutex<CallScope>>,
    address: String,
}

impl AgentProcess {
    async fn run(
        self,
        mut instance: AgentInstance,
        mut rx: mpsc::Receiver<IpcEnvelope>,
        mut shutdown: watch::Receiver<bool>,
        ack: oneshot::Sender<IpcEnvelope>,
    ) {
        if let Err(error) = self.engine.recover_instance(&mut instance).await {
            self.emit(RuntimeEvent::warning(
                self.address.clone(),
                format!("instance recovery failed: {error}"),
            ));
        }
        self.emit(
            RuntimeEvent::new(EventKind::ProcessReady, self.address.clone())
                .with("address", self.address.as_str()),
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                envelope = rx.recv() => {
                    match envelope {
                        None => break,
                        Some(envelope) => {
                            if self.handle(&mut instance, envelope).await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        // Drain: everything already queued still gets a turn.
        self.emit(
            RuntimeEvent::new(EventKind::ProcessDraining, self.address.clone())
                .with("address", self.address.as_str()),
        );
        rx.close();
        while let Some(envelope) = rx.recv().await {
            self.handle(&mut instance, envelope).await;
        }

        self.emit(
            RuntimeEvent::new(EventKind::ProcessExited, self.address.clone())
                .with("address", self.address.as_str()),
        );
        let _ = ack.send(IpcEnvelope::shutdown_ack(self.address.clone()));
    }

    /// Returns true when the envelope asks the process to stop.
    async fn handle(&self, instance: &mut AgentInstance, envelope: IpcEnvelope) -> bool {
        match envelope.kind {
            EnvelopeKind::Shutdown => true,
            EnvelopeKind::ShutdownAck => false,
            EnvelopeKind::Event => {
                if let Some(payload) = envelope.payload {
                    self.handle_call(instance, payload).await;
                }
                false
            }
        }
    }

    async fn handle_call(&self, instance: &mut AgentInstance, payload: AgentCallPayload) {
        if payload.is_reply() {
            // Replies are routed by the supervisor; one reaching the queue
            // means a routing bug upstream.
            self.emit(RuntimeEvent::warning(
                payload.trace_id.clone(),
                "reply payload reached the process queue",
            ));
            return;
        }

        let preamble_events = self.drain_inbox();

        let event = InboundEvent {
            source_kind: payload.source.kind.clone(),
            source_name: payload.source.name.clone(),
            event_name: match payload.kind {
                CallKind::Request => "agent_request".to_string(),
                _ => "agent_notification".to_string(),
            },
            instance_key: payload.instance_key.clone(),
            text: render_input(&payload.input),
            properties: Default::default(),
        };

        if let Ok(mut scope) = self.scope.lock() {
            scope.stack = payload.call_stack.clone();
            scope.trace_id = Some(payload.trace_id.clone());
            scope.auth = payload.auth.clone();
        }

        let input = TurnInput {
            event,
            trace_id: Some(payload.trace_id.clone()),
            auth: payload.auth.clone(),
            preamble_events,
        };
        let outcome = self.engine.run_turn(instance, input).await;

        if let Ok(mut scope) = self.scope.lock() {
            *scope = CallScope::default();
        }

        match (payload.kind, payload.reply_to.as_deref(), outcome) {
            (CallKind::Request, Some(reply_to), Ok(turn)) => {
                let value = turn
                    .final_response()
                    .map(Value::String)
                    .unwrap_or(Value::Null);
                let reply = AgentCallPayload::response(
                    &payload.id,
                    value,
                    self.source(),
                    &payload.trace_id,
                );
                self.deliver_reply(reply_to, reply).await;
            }
            (CallKind::Request, Some(reply_to), Err(error)) => {
                // A failed turn still answers its caller; the turn error
                // travels as a delivery failure.
                let reply = AgentCallPayload::error_response(
                    &payload.id,
                    "IPC_DELIVERY_FAILED",
                    &error.to_string(),
                    self.source(),
                    &payload.trace_id,
                );
                self.deliver_reply(reply_to, reply).await;
            }
            (_, _, Err(error)) => {
                self.emit(RuntimeEvent::error(
                    payload.trace_id.clone(),
                    format!("turn failed for notification: {error}"),
                ));
            }
            (_, _, Ok(_)) => {}
        }
    }

    fn drain_inbox(&self) -> Vec<MessageEvent> {
        let Some(runtime) = self.runtime.upgrade() else {
            return Vec::new();
        };
        runtime
            .inbox
            .drain(&self.address)
            .into_iter()
            .map(|entry| {
                let text = render_inbox_entry(&entry);
                MessageEvent::append(Message::user(text, entry.target))
            })
            .collect()
    }

    async fn deliver_reply(&self, reply_to: &str, reply: AgentCallPayload) {
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };
        let envelope = IpcEnvelope::event(self.address.clone(), reply_to.to_string(), reply);
        if let Err(error) = runtime.deliver(envelope).await {
            self.emit(RuntimeEvent::warning(
                self.address.clone(),
                format!("reply delivery to '{reply_to}' failed: {error}"),
            ));
        }
    }

    fn source(&self) -> CallSource {
        CallSource {
            kind: "agent".to_string(),
            name: self.address.clone(),
        }
    }

    fn emit(&self, event: RuntimeEvent) {
        if let Some(runtime) = self.runtime.upgrade() {
            let _ = runtime.emitter.emit(event);
        }
    }
}

fn render_input(input: &Value) -> String {
    match input {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn render_inbox_entry(entry: &InboxEntry) -> String {
    let status = match entry.status {
        InboxStatus::Ok => "completed",
        InboxStatus::Error => "failed",
        InboxStatus::Timeout => "timed out",
    };
    format!(
        "Async reply from {} (request {}, trace {}, {}): {}",
        entry.target,
        entry.request_id,
        entry.trace_id,
        status,
        render_input(&entry.payload)
    )
}

impl ProcessHandle {
    pub(crate) fn set_cwd(&self, cwd: Option<String>) {
        if let Ok(mut slot) = self.cwd.lock() {
            if cwd.is_some() {
                *slot = cwd;
            }
        }
    }

    pub(crate) fn cwd(&self) -> Option<String> {
        self.cwd.lock().ok().and_then(|slot| slot.clone())
    }
}
