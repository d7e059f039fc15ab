//! The step state machine.
//!
//! Stages run in a fixed order: config, tools, blocks, llmInput, llmCall,
//! then tool execution and post when the model issued tool calls. Mutators
//! run at each stage boundary; `step.llmCall` and `toolCall.exec` are the two
//! wrap points. A stage failure finalizes the step as failed before the error
//! propagates to the turn.

use quorum_llm::{ModelRequest, ModelResponse, ToolCall};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::EngineError;
use crate::catalog::{ToolCallResult, ToolCatalogItem, build_catalog, find_catalog_item};
use crate::config::RevisionRef;
use crate::events::{EventKind, RuntimeEvent};
use crate::messages::{Message, MessageEvent, TurnMessageState};
use crate::pipeline::{
    NextLlmCall, NextToolExec, PipelineIds, StepPoint, StepStageContext, ToolCallPoint,
    ToolCallStageContext,
};
use crate::worker::{CommitNotifyingHost, RevisionSink, ToolContext};

use super::{Turn, TurnEngine, apply_emitted, read_revision, write_revision};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Pending,
    Config,
    Tools,
    Blocks,
    LlmInput,
    LlmCall,
    ToolExec,
    Post,
    Completed,
    Failed,
}

/// One model interaction within a turn, with everything resolved for it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub index: usize,
    pub status: StepStatus,
    pub revision: RevisionRef,
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_catalog: Vec<ToolCatalogItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_result: Option<ModelResponse>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolCallResult>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Step {
    fn new(index: usize, revision: RevisionRef) -> Self {
        Self {
            id: format!("step-{}", Uuid::new_v4()),
            index,
            status: StepStatus::Pending,
            revision,
            model: String::new(),
            tool_catalog: Vec::new(),
            required_tools: Vec::new(),
            llm_result: None,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

impl TurnEngine {
    pub(super) async fn run_step(
        &self,
        ids: &PipelineIds,
        turn: &mut Turn,
        active_revision: &Arc<Mutex<RevisionRef>>,
        starting_revision: &RevisionRef,
        called_tools: &mut BTreeSet<String>,
    ) -> Result<(), EngineError> {
        let mut step = Step::new(turn.steps.len(), read_revision(active_revision)?);
        let _ = self.emitter.emit(
            RuntimeEvent::new(EventKind::StepStart, &ids.trace_id)
                .with("turnId", ids.turn_id.as_str())
                .with("stepId", step.id.as_str())
                .with("stepIndex", step.index as u64),
        );

        let outcome = self
            .run_step_stages(
                ids,
                &mut turn.message_state,
                &mut step,
                active_revision,
                starting_revision,
                called_tools,
            )
            .await;

        match outcome {
            Ok(()) => {
                step.status = StepStatus::Completed;
                let _ = self.emitter.emit(
                    RuntimeEvent::new(EventKind::StepEnd, &ids.trace_id)
                        .with("stepId", step.id.as_str())
                        .with("status", "completed"),
                );
                turn.steps.push(step);
                Ok(())
            }
            Err(error) => {
                step.status = StepStatus::Failed;
                step.metadata
                    .insert("error".to_string(), error.serialized());
                let _ = self.emitter.emit(
                    RuntimeEvent::new(EventKind::StepEnd, &ids.trace_id)
                        .with("stepId", step.id.as_str())
                        .with("status", "failed")
                        .with("error", error.to_string()),
                );
                turn.steps.push(step);
                Err(error)
            }
        }
    }

    async fn run_step_stages(
        &self,
        ids: &PipelineIds,
        state: &mut TurnMessageState,
        step: &mut Step,
        active_revision: &Arc<Mutex<RevisionRef>>,
        starting_revision: &RevisionRef,
        called_tools: &mut BTreeSet<String>,
    ) -> Result<(), EngineError> {
        // config: confirm or advance the turn's revision pointer. The pointer
        // moves when a changeset committed earlier in this turn (sink) or
        // when the loader reports an external advance; otherwise the turn
        // keeps the revision it started with.
        step.status = StepStatus::Config;
        let pointer = read_revision(active_revision)?;
        let loader_active = self.config_loader.active_revision().await?;
        let revision = if loader_active != *starting_revision && loader_active != pointer {
            loader_active
        } else {
            pointer
        };
        write_revision(active_revision, revision.clone());
        step.revision = revision.clone();

        let effective = self.config_loader.load(&revision, &ids.agent_name).await?;
        step.model = effective.model.clone();
        step.required_tools = effective.required_tool_names();

        let mut ctx = StepStageContext {
            ids: ids.clone(),
            step_id: step.id.clone(),
            step_index: step.index,
            revision: revision.clone(),
            model: effective.model.clone(),
            system_prompt: effective.system_prompt.clone(),
            tool_catalog: Vec::new(),
            blocks: Vec::new(),
            llm_input: Vec::new(),
            metadata: BTreeMap::new(),
            emitted_events: Vec::new(),
        };
        ctx = self.pipeline.run_step_mutators(StepPoint::Config, ctx).await?;
        apply_emitted(
            state,
            std::mem::take(&mut ctx.emitted_events),
            Some(&step.id),
        );

        // tools: rebuild the catalog from the effective config, then let
        // extensions adjust it.
        step.status = StepStatus::Tools;
        ctx.tool_catalog = build_catalog(&effective.tools)?;
        ctx = self.pipeline.run_step_mutators(StepPoint::Tools, ctx).await?;
        apply_emitted(
            state,
            std::mem::take(&mut ctx.emitted_events),
            Some(&step.id),
        );
        step.tool_catalog = ctx.tool_catalog.clone();

        // blocks
        step.status = StepStatus::Blocks;
        ctx = self.pipeline.run_step_mutators(StepPoint::Blocks, ctx).await?;
        apply_emitted(
            state,
            std::mem::take(&mut ctx.emitted_events),
            Some(&step.id),
        );

        // llmInput: the derived transcript becomes the request body.
        step.status = StepStatus::LlmInput;
        ctx.llm_input = state.next().iter().map(Message::to_chat).collect();
        ctx = self
            .pipeline
            .run_step_mutators(StepPoint::LlmInput, ctx)
            .await?;
        apply_emitted(
            state,
            std::mem::take(&mut ctx.emitted_events),
            Some(&step.id),
        );

        // llmCall
        step.status = StepStatus::LlmCall;
        step.model = ctx.model.clone();
        let provider = self.provider.clone();
        let terminal: NextLlmCall = Box::new(move |ctx| {
            Box::pin(async move {
                let request = ModelRequest {
                    model: ctx.model.clone(),
                    system: render_system(&ctx),
                    messages: ctx.llm_input.clone(),
                    tools: ctx
                        .tool_catalog
                        .iter()
                        .map(ToolCatalogItem::to_definition)
                        .collect(),
                };
                let response = provider.complete(request).await?;
                Ok((ctx, response))
            })
        });
        let (mut ctx, response) = self.pipeline.run_llm_call(ctx, terminal).await?;
        apply_emitted(
            state,
            std::mem::take(&mut ctx.emitted_events),
            Some(&step.id),
        );
        step.llm_result = Some(response.clone());
        step.tool_calls = response.tool_calls.clone();

        let assistant = Message::assistant(
            response.content.clone(),
            step.id.clone(),
            response.tool_calls.clone(),
        );
        state.apply(MessageEvent::append(assistant), Some(step.id.clone()));

        if !step.tool_calls.is_empty() {
            step.status = StepStatus::ToolExec;
            for call in step.tool_calls.clone() {
                called_tools.insert(call.name.clone());
                let result = self
                    .run_tool_call(ids, state, step, active_revision, call)
                    .await?;
                let transcript = Message::tool_result(
                    result.tool_call_id.clone(),
                    result.tool_name.clone(),
                    result.transcript_content(),
                );
                state.apply(MessageEvent::append(transcript), Some(step.id.clone()));
                step.tool_results.push(result);
            }
        }

        step.status = StepStatus::Post;
        Ok(())
    }

    /// One tool call: toolCall.pre, catalog and argument enforcement, the
    /// exec wrap chain, toolCall.post. Tool-level failures come back as error
    /// results; only engine faults propagate.
    async fn run_tool_call(
        &self,
        ids: &PipelineIds,
        state: &mut TurnMessageState,
        step: &Step,
        active_revision: &Arc<Mutex<RevisionRef>>,
        call: ToolCall,
    ) -> Result<ToolCallResult, EngineError> {
        let _ = self.emitter.emit(
            RuntimeEvent::new(EventKind::ToolCallStart, &ids.trace_id)
                .with("stepId", step.id.as_str())
                .with("toolCallId", call.id.as_str())
                .with("toolName", call.name.as_str()),
        );

        let mut ctx = ToolCallStageContext {
            ids: ids.clone(),
            step_id: step.id.clone(),
            tool_call: call,
            result: None,
            metadata: BTreeMap::new(),
            emitted_events: Vec::new(),
        };
        ctx = self
            .pipeline
            .run_tool_call_mutators(ToolCallPoint::Pre, ctx)
            .await?;
        apply_emitted(
            state,
            std::mem::take(&mut ctx.emitted_events),
            Some(&step.id),
        );

        // Enforcement happens before any handler dispatch. A result set by
        // toolCall.pre short-circuits everything, including enforcement.
        let (mut ctx, result) = match ctx.result.take() {
            Some(result) => (ctx, result),
            None => match find_catalog_item(&step.tool_catalog, &ctx.tool_call.name) {
                None => {
                    let result = ToolCallResult::not_in_catalog(
                        ctx.tool_call.id.clone(),
                        &ctx.tool_call.name,
                    );
                    (ctx, result)
                }
                Some(item) => {
                    let issues = item.parameters.validate_value(&ctx.tool_call.arguments);
                    if !issues.is_empty() {
                        let result = ToolCallResult::invalid_args(
                            ctx.tool_call.id.clone(),
                            &ctx.tool_call.name,
                            &issues,
                        );
                        (ctx, result)
                    } else {
                        let limit = item
                            .error_message_limit
                            .unwrap_or(self.config.error_message_limit);
                        let context = self.tool_context(ids, step, active_revision, &ctx.tool_call);
                        let pool = self.pool.clone();
                        let revision = step.revision.clone();
                        let package = item.source.clone();
                        let terminal: NextToolExec = Box::new(move |ctx| {
                            Box::pin(async move {
                                let call = ctx.tool_call.clone();
                                let outcome = pool
                                    .execute(
                                        &revision,
                                        &package,
                                        &call.name,
                                        context,
                                        call.arguments.clone(),
                                    )
                                    .await;
                                let result = match outcome {
                                    Ok(output) => ToolCallResult::ok(&call.id, &call.name, output),
                                    Err(error) => ToolCallResult::execution_error(
                                        &call.id,
                                        &call.name,
                                        error.name.clone(),
                                        &error.message,
                                        limit,
                                    ),
                                };
                                Ok((ctx, result))
                            })
                        });
                        self.pipeline.run_tool_exec(ctx, terminal).await?
                    }
                }
            },
        };

        ctx.result = Some(result);
        ctx = self
            .pipeline
            .run_tool_call_mutators(ToolCallPoint::Post, ctx)
            .await?;
        apply_emitted(
            state,
            std::mem::take(&mut ctx.emitted_events),
            Some(&step.id),
        );

        let final_result = match ctx.result.take() {
            Some(result) => result,
            None => ToolCallResult::execution_error(
                ctx.tool_call.id.clone(),
                &ctx.tool_call.name,
                "ToolResultMissingError",
                "a post-call extension cleared the tool result",
                self.config.error_message_limit,
            ),
        };

        let _ = self.emitter.emit(
            RuntimeEvent::new(EventKind::ToolCallEnd, &ids.trace_id)
                .with("stepId", step.id.as_str())
                .with("toolCallId", final_result.tool_call_id.as_str())
                .with("toolName", final_result.tool_name.as_str())
                .with("isError", final_result.is_error()),
        );

        Ok(final_result)
    }

    fn tool_context(
        &self,
        ids: &PipelineIds,
        step: &Step,
        active_revision: &Arc<Mutex<RevisionRef>>,
        call: &ToolCall,
    ) -> ToolContext {
        let cell = active_revision.clone();
        let sink: RevisionSink = Arc::new(move |revision| {
            write_revision(&cell, revision);
        });
        ToolContext {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            agent_name: ids.agent_name.clone(),
            instance_key: ids.instance_key.clone(),
            turn_id: ids.turn_id.clone(),
            trace_id: ids.trace_id.clone(),
            step_id: step.id.clone(),
            revision: step.revision.clone(),
            state_snapshot: json!({
                "agentName": ids.agent_name,
                "instanceKey": ids.instance_key,
                "turnId": ids.turn_id,
                "traceId": ids.trace_id,
                "stepId": step.id,
                "stepIndex": step.index,
                "model": step.model,
                "revision": step.revision.as_str(),
            }),
            host: Arc::new(CommitNotifyingHost::new(self.host.clone(), sink)),
            link: self.link.clone(),
        }
    }
}

/// Prompt blocks render below the system prompt, in contribution order.
fn render_system(ctx: &StepStageContext) -> String {
    let mut system = ctx.system_prompt.clone();
    for block in &ctx.blocks {
        let body = match &block.data {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        system.push_str("\n\n");
        system.push_str(&body);
    }
    system
}
