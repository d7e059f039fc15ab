//! Extension-point pipeline.
//!
//! Two extension kinds exist at named points: mutators transform and return
//! their context, chained in priority-then-registration order; wrappers are
//! middleware around a required terminal handler and compose outer-to-inner
//! in that same order. Only `step.llmCall` and `toolCall.exec` are wrap
//! points. Contexts cross extension boundaries by value; the sole sanctioned
//! side channel into MessageState is the append-only `emitted_events` list.

use quorum_llm::{ChatMessage, ModelResponse, ToolCall};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::EngineError;
use crate::catalog::{ToolCallResult, ToolCatalogItem};
use crate::config::RevisionRef;
use crate::messages::MessageEvent;

pub type PipelineFuture<T> = Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send>>;

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineIds {
    pub agent_name: String,
    pub instance_key: String,
    pub turn_id: String,
    pub trace_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TurnStageContext {
    pub ids: PipelineIds,
    pub input_text: String,
    pub metadata: BTreeMap<String, Value>,
    pub emitted_events: Vec<MessageEvent>,
}

/// One prompt-building block contributed at `step.blocks`.
#[derive(Clone, Debug, PartialEq)]
pub struct ContextBlock {
    pub kind: String,
    pub data: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepStageContext {
    pub ids: PipelineIds,
    pub step_id: String,
    pub step_index: usize,
    pub revision: RevisionRef,
    pub model: String,
    pub system_prompt: String,
    pub tool_catalog: Vec<ToolCatalogItem>,
    pub blocks: Vec<ContextBlock>,
    pub llm_input: Vec<ChatMessage>,
    pub metadata: BTreeMap<String, Value>,
    pub emitted_events: Vec<MessageEvent>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallStageContext {
    pub ids: PipelineIds,
    pub step_id: String,
    pub tool_call: ToolCall,
    /// Set by `toolCall.pre` to short-circuit execution, or by
    /// `toolCall.post` to override the outcome.
    pub result: Option<ToolCallResult>,
    pub metadata: BTreeMap<String, Value>,
    pub emitted_events: Vec<MessageEvent>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TurnPoint {
    Pre,
    Post,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StepPoint {
    Config,
    Tools,
    Blocks,
    LlmInput,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ToolCallPoint {
    Pre,
    Post,
}

pub type TurnMutator =
    Arc<dyn Fn(TurnStageContext) -> PipelineFuture<TurnStageContext> + Send + Sync>;
pub type StepMutator =
    Arc<dyn Fn(StepStageContext) -> PipelineFuture<StepStageContext> + Send + Sync>;
pub type ToolCallMutator =
    Arc<dyn Fn(ToolCallStageContext) -> PipelineFuture<ToolCallStageContext> + Send + Sync>;

pub type LlmCallOutcome = (StepStageContext, ModelResponse);
pub type NextLlmCall = Box<dyn FnOnce(StepStageContext) -> PipelineFuture<LlmCallOutcome> + Send>;
pub type LlmCallWrapper =
    Arc<dyn Fn(StepStageContext, NextLlmCall) -> PipelineFuture<LlmCallOutcome> + Send + Sync>;

pub type ToolExecOutcome = (ToolCallStageContext, ToolCallResult);
pub type NextToolExec =
    Box<dyn FnOnce(ToolCallStageContext) -> PipelineFuture<ToolExecOutcome> + Send>;
pub type ToolExecWrapper = Arc<
    dyn Fn(ToolCallStageContext, NextToolExec) -> PipelineFuture<ToolExecOutcome> + Send + Sync,
>;

#[derive(Clone, Debug, Default)]
pub struct RegisterOptions {
    pub priority: i32,
    pub id: Option<String>,
}

struct Registered<F> {
    handler: F,
    priority: i32,
    order: usize,
    #[allow(dead_code)]
    id: Option<String>,
}

#[derive(Default)]
pub struct PipelineRegistry {
    turn_pre: Vec<Registered<TurnMutator>>,
    turn_post: Vec<Registered<TurnMutator>>,
    step_config: Vec<Registered<StepMutator>>,
    step_tools: Vec<Registered<StepMutator>>,
    step_blocks: Vec<Registered<StepMutator>>,
    step_llm_input: Vec<Registered<StepMutator>>,
    llm_call: Vec<Registered<LlmCallWrapper>>,
    tool_call_pre: Vec<Registered<ToolCallMutator>>,
    tool_call_post: Vec<Registered<ToolCallMutator>>,
    tool_exec: Vec<Registered<ToolExecWrapper>>,
    next_order: usize,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mutate_turn(&mut self, point: TurnPoint, handler: TurnMutator) {
        self.mutate_turn_with(point, handler, RegisterOptions::default());
    }

    pub fn mutate_turn_with(
        &mut self,
        point: TurnPoint,
        handler: TurnMutator,
        options: RegisterOptions,
    ) {
        let entry = self.entry(handler, options);
        match point {
            TurnPoint::Pre => self.turn_pre.push(entry),
            TurnPoint::Post => self.turn_post.push(entry),
        }
    }

    pub fn mutate_step(&mut self, point: StepPoint, handler: StepMutator) {
        self.mutate_step_with(point, handler, RegisterOptions::default());
    }

    pub fn mutate_step_with(
        &mut self,
        point: StepPoint,
        handler: StepMutator,
        options: RegisterOptions,
    ) {
        let entry = self.entry(handler, options);
        match point {
            StepPoint::Config => self.step_config.push(entry),
            StepPoint::Tools => self.step_tools.push(entry),
            StepPoint::Blocks => self.step_blocks.push(entry),
            StepPoint::LlmInput => self.step_llm_input.push(entry),
        }
    }

    pub fn mutate_tool_call(&mut self, point: ToolCallPoint, handler: ToolCallMutator) {
        self.mutate_tool_call_with(point, handler, RegisterOptions::default());
    }

    pub fn mutate_tool_call_with(
        &mut self,
        point: ToolCallPoint,
        handler: ToolCallMutator,
        options: RegisterOptions,
    ) {
        let entry = self.entry(handler, options);
        match point {
            ToolCallPoint::Pre => self.tool_call_pre.push(entry),
            ToolCallPoint::Post => self.tool_call_post.push(entry),
        }
    }

    pub fn wrap_llm_call(&mut self, handler: LlmCallWrapper) {
        self.wrap_llm_call_with(handler, RegisterOptions::default());
    }

    pub fn wrap_llm_call_with(&mut self, handler: LlmCallWrapper, options: RegisterOptions) {
        let entry = self.entry(handler, options);
        self.llm_call.push(entry);
    }

    pub fn wrap_tool_exec(&mut self, handler: ToolExecWrapper) {
        self.wrap_tool_exec_with(handler, RegisterOptions::default());
    }

    pub fn wrap_tool_exec_with(&mut self, handler: ToolExecWrapper, options: RegisterOptions) {
        let entry = self.entry(handler, options);
        self.tool_exec.push(entry);
    }

    fn entry<F>(&mut self, handler: F, options: RegisterOptions) -> Registered<F> {
        let order = self.next_order;
        self.next_order += 1;
        Registered {
            handler,
            priority: options.priority,
            order,
            id: options.id,
        }
    }

    fn sorted<F: Clone>(entries: &[Registered<F>]) -> Vec<F> {
        let mut indices: Vec<usize> = (0..entries.len()).collect();
        indices.sort_by_key(|&index| (entries[index].priority, entries[index].order));
        indices
            .into_iter()
            .map(|index| entries[index].handler.clone())
            .collect()
    }

    pub async fn run_turn_mutators(
        &self,
        point: TurnPoint,
        mut ctx: TurnStageContext,
    ) -> Result<TurnStageContext, EngineError> {
        let mutators = match point {
            TurnPoint::Pre => Self::sorted(&self.turn_pre),
            TurnPoint::Post => Self::sorted(&self.turn_post),
        };
        for mutator in mutators {
            ctx = mutator(ctx).await?;
        }
        Ok(ctx)
    }

    pub async fn run_step_mutators(
        &self,
        point: StepPoint,
        mut ctx: StepStageContext,
    ) -> Result<StepStageContext, EngineError> {
        let mutators = match point {
            StepPoint::Config => Self::sorted(&self.step_config),
            StepPoint::Tools => Self::sorted(&self.step_tools),
            StepPoint::Blocks => Self::sorted(&self.step_blocks),
            StepPoint::LlmInput => Self::sorted(&self.step_llm_input),
        };
        for mutator in mutators {
            ctx = mutator(ctx).await?;
        }
        Ok(ctx)
    }

    pub async fn run_tool_call_mutators(
        &self,
        point: ToolCallPoint,
        mut ctx: ToolCallStageContext,
    ) -> Result<ToolCallStageContext, EngineError> {
        let mutators = match point {
            ToolCallPoint::Pre => Self::sorted(&self.tool_call_pre),
            ToolCallPoint::Post => Self::sorted(&self.tool_call_post),
        };
        for mutator in mutators {
            ctx = mutator(ctx).await?;
        }
        Ok(ctx)
    }

    /// Run the `step.llmCall` onion around the terminal model call. The first
    /// registered wrapper is outermost.
    pub fn run_llm_call(
        &self,
        ctx: StepStageContext,
        terminal: NextLlmCall,
    ) -> PipelineFuture<LlmCallOutcome> {
        let wrappers = Self::sorted(&self.llm_call);
        let mut next = terminal;
        for wrapper in wrappers.into_iter().rev() {
            let inner = next;
            next = Box::new(move |ctx| wrapper(ctx, inner));
        }
        next(ctx)
    }

    /// Run the `toolCall.exec` onion around the terminal dispatch.
    pub fn run_tool_exec(
        &self,
        ctx: ToolCallStageContext,
        terminal: NextToolExec,
    ) -> PipelineFuture<ToolExecOutcome> {
        let wrappers = Self::sorted(&self.tool_exec);
        let mut next = terminal;
        for wrapper in wrappers.into_iter().rev() {
            let inner = next;
            next = Box::new(move |ctx| wrapper(ctx, inner));
        }
        next(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_llm::FinishReason;
    use std::sync::Mutex;

    fn ids() -> PipelineIds {
        PipelineIds {
            agent_name: "planner".to_string(),
            instance_key: "main".to_string(),
            turn_id: "turn-1".to_string(),
            trace_id: "trace-1".to_string(),
        }
    }

    fn turn_ctx() -> TurnStageContext {
        TurnStageContext {
            ids: ids(),
            input_text: "hello".to_string(),
            metadata: BTreeMap::new(),
            emitted_events: Vec::new(),
        }
    }

    fn step_ctx() -> StepStageContext {
        StepStageContext {
            ids: ids(),
            step_id: "step-1".to_string(),
            step_index: 0,
            revision: RevisionRef::from_commit("aaa"),
            model: "stub".to_string(),
            system_prompt: "system".to_string(),
            tool_catalog: Vec::new(),
            blocks: Vec::new(),
            llm_input: Vec::new(),
            metadata: BTreeMap::new(),
            emitted_events: Vec::new(),
        }
    }

    fn tagging_mutator(tag: &'static str) -> TurnMutator {
        Arc::new(move |mut ctx: TurnStageContext| {
            Box::pin(async move {
                ctx.input_text.push(':');
                ctx.input_text.push_str(tag);
                Ok(ctx)
            })
        })
    }

    #[tokio::test]
    async fn mutators_chain_in_registration_order() {
        let mut registry = PipelineRegistry::new();
        registry.mutate_turn(TurnPoint::Pre, tagging_mutator("a"));
        registry.mutate_turn(TurnPoint::Pre, tagging_mutator("b"));

        let ctx = registry
            .run_turn_mutators(TurnPoint::Pre, turn_ctx())
            .await
            .expect("mutators");
        assert_eq!(ctx.input_text, "hello:a:b");
    }

    #[tokio::test]
    async fn priority_beats_registration_order() {
        let mut registry = PipelineRegistry::new();
        registry.mutate_turn_with(
            TurnPoint::Pre,
            tagging_mutator("late"),
            RegisterOptions {
                priority: 10,
                id: None,
            },
        );
        registry.mutate_turn_with(
            TurnPoint::Pre,
            tagging_mutator("early"),
            RegisterOptions {
                priority: -10,
                id: None,
            },
        );

        let ctx = registry
            .run_turn_mutators(TurnPoint::Pre, turn_ctx())
            .await
            .expect("mutators");
        assert_eq!(ctx.input_text, "hello:early:late");
    }

    #[tokio::test]
    async fn llm_call_wrappers_compose_outer_to_inner() {
        let trace: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let recording_wrapper = |label_before: &'static str,
                                 label_after: &'static str,
                                 trace: Arc<Mutex<Vec<&'static str>>>|
         -> LlmCallWrapper {
            Arc::new(move |ctx, next| {
                let trace = trace.clone();
                Box::pin(async move {
                    trace.lock().expect("trace mutex").push(label_before);
                    let outcome = next(ctx).await?;
                    trace.lock().expect("trace mutex").push(label_after);
                    Ok(outcome)
                })
            })
        };

        let mut registry = PipelineRegistry::new();
        registry.wrap_llm_call(recording_wrapper("outer:pre", "outer:post", trace.clone()));
        registry.wrap_llm_call(recording_wrapper("inner:pre", "inner:post", trace.clone()));

        let terminal_trace = trace.clone();
        let terminal: NextLlmCall = Box::new(move |ctx| {
            Box::pin(async move {
                terminal_trace.lock().expect("trace mutex").push("terminal");
                let response = ModelResponse {
                    content: "done".to_string(),
                    tool_calls: vec![],
                    finish_reason: FinishReason::Stop,
                    usage: Default::default(),
                };
                Ok((ctx, response))
            })
        });

        let (_ctx, response) = registry
            .run_llm_call(step_ctx(), terminal)
            .await
            .expect("llm call chain");
        assert_eq!(response.content, "done");
        assert_eq!(
            *trace.lock().expect("trace mutex"),
            vec![
                "outer:pre",
                "inner:pre",
                "terminal",
                "inner:post",
                "outer:post"
            ]
        );
    }

    #[tokio::test]
    async fn wrapper_can_short_circuit_the_terminal() {
        let mut registry = PipelineRegistry::new();
        registry.wrap_llm_call(Arc::new(|ctx, _next| {
            Box::pin(async move {
                let response = ModelResponse {
                    content: "cached".to_string(),
                    tool_calls: vec![],
                    finish_reason: FinishReason::Stop,
                    usage: Default::default(),
                };
                Ok((ctx, response))
            })
        }));

        let terminal: NextLlmCall = Box::new(|_ctx| {
            Box::pin(async move {
                Err(EngineError::Extension(
                    "terminal must not run".to_string(),
                ))
            })
        });

        let (_ctx, response) = registry
            .run_llm_call(step_ctx(), terminal)
            .await
            .expect("short circuit");
        assert_eq!(response.content, "cached");
    }
}
