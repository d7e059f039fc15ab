//! Turn execution.
//!
//! A turn is the full processing of one inbound event by one agent instance:
//! turn.pre mutators, the inbound append, the step loop, turn.post mutators,
//! then settlement (persist deltas, consolidate the base, carry the history
//! forward). Step internals live in `step.rs`, settlement and crash recovery
//! in `persistence.rs`.

mod persistence;
mod step;

pub use step::{Step, StepStatus};

use quorum_llm::{ModelProvider, Role, Usage};
use quorum_store::StateStore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

use crate::EngineError;
use crate::config::{ConfigLoader, EngineConfig, RevisionRef};
use crate::events::{EventEmitter, EventKind, NoopEventEmitter, RuntimeEvent, now_ms};
use crate::link::AgentLink;
use crate::messages::{InboundEvent, Message, MessageEvent, TurnMessageState};
use crate::pipeline::{PipelineIds, PipelineRegistry, TurnPoint, TurnStageContext};
use crate::worker::{NoopWorkerHost, WorkerHost, WorkerPool};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOrigin {
    pub source_kind: String,
    pub source_name: String,
    pub event_name: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMetrics {
    pub steps: usize,
    pub tool_calls: usize,
    pub duration_ms: u64,
    pub usage: Usage,
}

/// One input event's lifecycle. Owned by exactly one agent instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub trace_id: String,
    pub origin: TurnOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
    pub message_state: TurnMessageState,
    pub steps: Vec<Step>,
    pub status: TurnStatus,
    pub metrics: TurnMetrics,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Turn {
    /// Last assistant message in the derived transcript, if any.
    pub fn final_response(&self) -> Option<String> {
        self.message_state
            .next()
            .iter()
            .rev()
            .find(|message| message.role == Role::Assistant)
            .map(|message| message.content.clone())
    }
}

/// One agent instance's carried state between turns.
#[derive(Clone, Debug)]
pub struct AgentInstance {
    pub instance_id: String,
    pub agent_name: String,
    pub instance_key: String,
    pub history: Vec<Message>,
    pub paused: bool,
    pub completed_turns: u64,
}

impl AgentInstance {
    pub fn new(agent_name: impl Into<String>, instance_key: impl Into<String>) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            agent_name: agent_name.into(),
            instance_key: instance_key.into(),
            history: Vec::new(),
            paused: false,
            completed_turns: 0,
        }
    }
}

/// Everything a single run_turn call needs beyond the instance itself.
#[derive(Clone, Debug)]
pub struct TurnInput {
    pub event: InboundEvent,
    pub trace_id: Option<String>,
    pub auth: Option<Value>,
    /// Events injected before the step loop, e.g. drained async-inbox
    /// entries rendered as synthetic inbound messages.
    pub preamble_events: Vec<MessageEvent>,
}

impl TurnInput {
    pub fn new(event: InboundEvent) -> Self {
        Self {
            event,
            trace_id: None,
            auth: None,
            preamble_events: Vec::new(),
        }
    }
}

pub struct TurnEngine {
    pub(crate) config: EngineConfig,
    pub(crate) config_loader: Arc<dyn ConfigLoader>,
    pub(crate) provider: Arc<dyn ModelProvider>,
    pub(crate) pipeline: Arc<PipelineRegistry>,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) emitter: Arc<dyn EventEmitter>,
    pub(crate) host: Arc<dyn WorkerHost>,
    pub(crate) link: Option<Arc<dyn AgentLink>>,
}

impl TurnEngine {
    pub fn new(
        config: EngineConfig,
        config_loader: Arc<dyn ConfigLoader>,
        provider: Arc<dyn ModelProvider>,
        pipeline: Arc<PipelineRegistry>,
        pool: Arc<WorkerPool>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            config_loader,
            provider,
            pipeline,
            pool,
            store,
            emitter: Arc::new(NoopEventEmitter),
            host: Arc::new(NoopWorkerHost),
            link: None,
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_host(mut self, host: Arc<dyn WorkerHost>) -> Self {
        self.host = host;
        self
    }

    pub fn with_link(mut self, link: Arc<dyn AgentLink>) -> Self {
        self.link = Some(link);
        self
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Run one turn to completion. A step-fatal failure still finalizes and
    /// persists the turn, then surfaces as `EngineError::TurnFailed` carrying
    /// the finalized turn.
    pub async fn run_turn(
        &self,
        instance: &mut AgentInstance,
        input: TurnInput,
    ) -> Result<Turn, EngineError> {
        let started = Instant::now();
        let trace_id = input
            .trace_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut turn = Turn {
            id: Uuid::new_v4().to_string(),
            trace_id: trace_id.clone(),
            origin: TurnOrigin {
                source_kind: input.event.source_kind.clone(),
                source_name: input.event.source_name.clone(),
                event_name: input.event.event_name.clone(),
            },
            auth: input.auth.clone(),
            message_state: TurnMessageState::with_base(instance.history.clone()),
            steps: Vec::new(),
            status: TurnStatus::Pending,
            metrics: TurnMetrics::default(),
            metadata: BTreeMap::new(),
        };

        if instance.paused {
            turn.status = TurnStatus::Interrupted;
            let _ = self.emitter.emit(
                RuntimeEvent::new(EventKind::TurnInterrupted, &trace_id)
                    .with("turnId", turn.id.clone())
                    .with("agentName", instance.agent_name.clone()),
            );
            let _ = self.record_lifecycle(instance, &turn, "turn_interrupted").await;
            return Ok(turn);
        }

        turn.status = TurnStatus::Running;
        let _ = self.emitter.emit(
            RuntimeEvent::new(EventKind::TurnStart, &trace_id)
                .with("turnId", turn.id.clone())
                .with("agentName", instance.agent_name.clone())
                .with("instanceKey", instance.instance_key.clone()),
        );

        let starting_revision = self.config_loader.active_revision().await?;
        let active_revision = Arc::new(Mutex::new(starting_revision.clone()));
        self.pool.begin_turn(&starting_revision).await?;

        let outcome = self
            .drive_turn(instance, &mut turn, &input, &active_revision, &starting_revision)
            .await;

        self.pool.end_turn(&starting_revision);

        let failure = match outcome {
            Ok(()) => {
                turn.status = TurnStatus::Completed;
                None
            }
            Err(error) => {
                turn.status = TurnStatus::Failed;
                turn.metadata.insert("error".to_string(), error.serialized());
                Some(error)
            }
        };

        // Settlement runs on both paths; its failures are soft and never mask
        // the step-loop error.
        if let Err(persist_error) = self.settle_turn(instance, &mut turn).await {
            turn.metadata.insert(
                "persistenceError".to_string(),
                json!(persist_error.to_string()),
            );
            let _ = self.emitter.emit(RuntimeEvent::warning(
                &trace_id,
                format!("turn settlement failed: {persist_error}"),
            ));
        }

        turn.metrics = TurnMetrics {
            steps: turn.steps.len(),
            tool_calls: turn
                .steps
                .iter()
                .map(|step| step.tool_results.len())
                .sum(),
            duration_ms: started.elapsed().as_millis() as u64,
            usage: turn.steps.iter().fold(Usage::default(), |mut usage, step| {
                if let Some(result) = &step.llm_result {
                    usage.accumulate(result.usage);
                }
                usage
            }),
        };

        let _ = self.record_lifecycle(instance, &turn, "turn_settled").await;
        let _ = self.emitter.emit(
            RuntimeEvent::new(EventKind::TurnEnd, &trace_id)
                .with("turnId", turn.id.clone())
                .with("status", status_label(turn.status))
                .with("steps", turn.metrics.steps as u64),
        );

        match failure {
            Some(error) => Err(EngineError::TurnFailed {
                turn_id: turn.id.clone(),
                turn: Box::new(turn),
                source: Box::new(error),
            }),
            None => {
                instance.completed_turns += 1;
                Ok(turn)
            }
        }
    }

    async fn drive_turn(
        &self,
        instance: &AgentInstance,
        turn: &mut Turn,
        input: &TurnInput,
        active_revision: &Arc<Mutex<RevisionRef>>,
        starting_revision: &RevisionRef,
    ) -> Result<(), EngineError> {
        let ids = PipelineIds {
            agent_name: instance.agent_name.clone(),
            instance_key: instance.instance_key.clone(),
            turn_id: turn.id.clone(),
            trace_id: turn.trace_id.clone(),
        };

        let mut pre_ctx = TurnStageContext {
            ids: ids.clone(),
            input_text: input.event.text.clone(),
            metadata: BTreeMap::new(),
            emitted_events: Vec::new(),
        };
        pre_ctx = self
            .pipeline
            .run_turn_mutators(TurnPoint::Pre, pre_ctx)
            .await?;
        apply_emitted(
            &mut turn.message_state,
            std::mem::take(&mut pre_ctx.emitted_events),
            None,
        );

        for event in input.preamble_events.clone() {
            turn.message_state.apply(event, None);
        }

        let mut user_message = Message::user(pre_ctx.input_text, &input.event.source_name);
        user_message
            .metadata
            .insert("sourceKind".to_string(), json!(input.event.source_kind));
        user_message
            .metadata
            .insert("eventName".to_string(), json!(input.event.event_name));
        turn.message_state
            .apply(MessageEvent::append(user_message), None);

        let mut called_tools: BTreeSet<String> = BTreeSet::new();
        loop {
            if turn.steps.len() >= self.config.max_steps_per_turn {
                turn.metadata
                    .insert("stepLimitReached".to_string(), json!(true));
                let limit_message = Message::assistant(
                    format!(
                        "Reached the maximum of {} steps for this turn without a final response.",
                        self.config.max_steps_per_turn
                    ),
                    "step-limit",
                    vec![],
                );
                turn.message_state
                    .apply(MessageEvent::append(limit_message), None);
                break;
            }

            self.run_step(&ids, turn, active_revision, starting_revision, &mut called_tools)
                .await?;

            let Some(last) = turn.steps.last() else {
                break;
            };
            let issued_tool_calls = last
                .llm_result
                .as_ref()
                .map(|result| !result.tool_calls.is_empty())
                .unwrap_or(false);
            if issued_tool_calls {
                continue;
            }

            let unmet: Vec<String> = last
                .required_tools
                .iter()
                .filter(|name| !called_tools.contains(*name))
                .cloned()
                .collect();
            if !unmet.is_empty() {
                let steering = Message::system(format!(
                    "Before finishing, you must call the required tool(s): {}.",
                    unmet.join(", ")
                ));
                turn.message_state
                    .apply(MessageEvent::system_message(steering), None);
                continue;
            }

            break;
        }

        let mut post_ctx = TurnStageContext {
            ids,
            input_text: input.event.text.clone(),
            metadata: BTreeMap::new(),
            emitted_events: Vec::new(),
        };
        post_ctx = self
            .pipeline
            .run_turn_mutators(TurnPoint::Post, post_ctx)
            .await?;
        apply_emitted(
            &mut turn.message_state,
            std::mem::take(&mut post_ctx.emitted_events),
            None,
        );

        Ok(())
    }

    async fn record_lifecycle(
        &self,
        instance: &AgentInstance,
        turn: &Turn,
        kind: &str,
    ) -> Result<(), EngineError> {
        self.store
            .append_lifecycle(quorum_store::LifecycleRecord {
                trace_id: turn.trace_id.clone(),
                instance_id: instance.instance_id.clone(),
                kind: kind.to_string(),
                timestamp_ms: now_ms(),
                data: json!({
                    "turnId": turn.id,
                    "agentName": instance.agent_name,
                    "instanceKey": instance.instance_key,
                    "status": status_label(turn.status),
                    "steps": turn.metrics.steps,
                    "toolCalls": turn.metrics.tool_calls,
                    "durationMs": turn.metrics.duration_ms,
                }),
            })
            .await?;
        Ok(())
    }
}

fn status_label(status: TurnStatus) -> &'static str {
    match status {
        TurnStatus::Pending => "pending",
        TurnStatus::Running => "running",
        TurnStatus::Completed => "completed",
        TurnStatus::Failed => "failed",
        TurnStatus::Interrupted => "interrupted",
    }
}

pub(crate) fn apply_emitted(
    state: &mut TurnMessageState,
    events: Vec<MessageEvent>,
    step_id: Option<&str>,
) {
    for event in events {
        state.apply(event, step_id.map(str::to_string));
    }
}

pub(crate) fn read_revision(
    cell: &Arc<Mutex<RevisionRef>>,
) -> Result<RevisionRef, EngineError> {
    cell.lock()
        .map(|guard| guard.clone())
        .map_err(|_| EngineError::InvalidConfiguration("revision pointer poisoned".to_string()))
}

pub(crate) fn write_revision(cell: &Arc<Mutex<RevisionRef>>, revision: RevisionRef) {
    if let Ok(mut guard) = cell.lock() {
        *guard = revision;
    }
}
