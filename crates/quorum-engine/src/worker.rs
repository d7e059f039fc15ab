//! Revision-isolated tool execution.
//!
//! Tool handlers load once per revision into a [`ToolRegistry`]; different
//! revisions never share registry state. Each pool generation owns an
//! isolated worker task reached over a channel (or dispatches in-process
//! when isolation is disabled) plus in-flight turn/call counters. A
//! generation is only retired when both counters are zero, so eviction never
//! races live work.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::EngineError;
use crate::config::RevisionRef;
use crate::events::{EventEmitter, EventKind, RuntimeEvent};
use crate::link::AgentLink;

const WORKER_QUEUE_DEPTH: usize = 32;

/// Failure raised by (or on behalf of) a tool handler. Always surfaced as an
/// error tool result, never as an engine failure.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct ToolHandlerError {
    pub name: String,
    pub message: String,
}

impl ToolHandlerError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new("ToolExecutionError", message)
    }
}

/// Result of opening a changeset against the active revision.
#[derive(Clone, Debug, PartialEq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesetHandle {
    pub changeset_id: String,
    pub base_revision: RevisionRef,
    pub workdir: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOutcome {
    pub new_revision: RevisionRef,
}

/// The narrow surface exposed to isolated tool code: a log relay and the
/// changeset API proxied back to the host. Nothing else crosses.
#[async_trait]
pub trait WorkerHost: Send + Sync {
    fn relay_log(&self, level: &str, message: &str);

    async fn open_changeset(&self, reason: &str) -> Result<ChangesetHandle, ToolHandlerError>;

    async fn commit_changeset(
        &self,
        changeset_id: &str,
        message: &str,
    ) -> Result<CommitOutcome, ToolHandlerError>;
}

/// Host for deployments without changeset support.
#[derive(Default)]
pub struct NoopWorkerHost;

#[async_trait]
impl WorkerHost for NoopWorkerHost {
    fn relay_log(&self, _level: &str, _message: &str) {}

    async fn open_changeset(&self, _reason: &str) -> Result<ChangesetHandle, ToolHandlerError> {
        Err(ToolHandlerError::new(
            "ChangesetUnsupportedError",
            "changesets are not available in this runtime",
        ))
    }

    async fn commit_changeset(
        &self,
        _changeset_id: &str,
        _message: &str,
    ) -> Result<CommitOutcome, ToolHandlerError> {
        Err(ToolHandlerError::new(
            "ChangesetUnsupportedError",
            "changesets are not available in this runtime",
        ))
    }
}

pub type RevisionSink = Arc<dyn Fn(RevisionRef) + Send + Sync>;

/// Wraps a host so successful commits also notify the turn's revision sink,
/// advancing the active pointer for subsequent steps. The committing step
/// keeps its starting revision.
pub struct CommitNotifyingHost {
    inner: Arc<dyn WorkerHost>,
    on_commit: RevisionSink,
}

impl CommitNotifyingHost {
    pub fn new(inner: Arc<dyn WorkerHost>, on_commit: RevisionSink) -> Self {
        Self { inner, on_commit }
    }
}

#[async_trait]
impl WorkerHost for CommitNotifyingHost {
    fn relay_log(&self, level: &str, message: &str) {
        self.inner.relay_log(level, message);
    }

    async fn open_changeset(&self, reason: &str) -> Result<ChangesetHandle, ToolHandlerError> {
        self.inner.open_changeset(reason).await
    }

    async fn commit_changeset(
        &self,
        changeset_id: &str,
        message: &str,
    ) -> Result<CommitOutcome, ToolHandlerError> {
        let outcome = self.inner.commit_changeset(changeset_id, message).await?;
        (self.on_commit)(outcome.new_revision.clone());
        Ok(outcome)
    }
}

/// Read-only execution context handed to a tool handler. Every value here is
/// already serialization-safe.
#[derive(Clone)]
pub struct ToolContext {
    pub tool_call_id: String,
    pub tool_name: String,
    pub agent_name: String,
    pub instance_key: String,
    pub turn_id: String,
    pub trace_id: String,
    pub step_id: String,
    pub revision: RevisionRef,
    pub state_snapshot: Value,
    pub host: Arc<dyn WorkerHost>,
    pub link: Option<Arc<dyn AgentLink>>,
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, ToolHandlerError>> + Send>>;
pub type ToolHandler = Arc<dyn Fn(ToolContext, Value) -> ToolFuture + Send + Sync>;

/// Handlers for one revision, keyed by (package, name).
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<(String, String), ToolHandler>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, package: &str, name: &str, handler: ToolHandler) {
        self.handlers
            .insert((package.to_string(), name.to_string()), handler);
    }

    pub fn get(&self, package: &str, name: &str) -> Option<ToolHandler> {
        self.handlers
            .get(&(package.to_string(), name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Collaborator contract: builds the tool registry for one revision. Called
/// once per generation; the result is cached for the generation's lifetime.
#[async_trait]
pub trait ToolModuleLoader: Send + Sync {
    async fn load(&self, revision: &RevisionRef) -> Result<ToolRegistry, EngineError>;
}

/// Loader backed by a builder closure. Useful for embedders whose tool set
/// does not vary by revision content, and for tests.
pub struct StaticModuleLoader {
    builder: Arc<dyn Fn(&RevisionRef) -> ToolRegistry + Send + Sync>,
}

impl StaticModuleLoader {
    pub fn new(builder: impl Fn(&RevisionRef) -> ToolRegistry + Send + Sync + 'static) -> Self {
        Self {
            builder: Arc::new(builder),
        }
    }
}

#[async_trait]
impl ToolModuleLoader for StaticModuleLoader {
    async fn load(&self, revision: &RevisionRef) -> Result<ToolRegistry, EngineError> {
        Ok((self.builder)(revision))
    }
}

struct WorkerRequest {
    package: String,
    tool_name: String,
    context: ToolContext,
    arguments: Value,
    reply: oneshot::Sender<Result<Value, ToolHandlerError>>,
}

struct WorkerHandle {
    tx: mpsc::Sender<WorkerRequest>,
    task: JoinHandle<()>,
}

fn spawn_worker(registry: Arc<ToolRegistry>) -> WorkerHandle {
    let (tx, mut rx) = mpsc::channel::<WorkerRequest>(WORKER_QUEUE_DEPTH);
    let task = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let outcome = match registry.get(&request.package, &request.tool_name) {
                Some(handler) => handler(request.context, request.arguments).await,
                None => Err(ToolHandlerError::new(
                    "HandlerNotFoundError",
                    format!(
                        "no handler registered for tool '{}' in package '{}'",
                        request.tool_name, request.package
                    ),
                )),
            };
            let _ = request.reply.send(outcome);
        }
    });
    WorkerHandle { tx, task }
}

struct Generation {
    registry: Arc<ToolRegistry>,
    worker: Option<WorkerHandle>,
    in_flight_turns: usize,
    in_flight_calls: usize,
    last_used: u64,
}

#[derive(Default)]
struct PoolState {
    generations: HashMap<String, Generation>,
    /// Logical clock driving LRU order; bumped on every touch.
    clock: u64,
}

enum Dispatch {
    Remote(mpsc::Sender<WorkerRequest>),
    Local(Arc<ToolRegistry>),
}

/// Pool of per-revision worker generations.
pub struct WorkerPool {
    loader: Arc<dyn ToolModuleLoader>,
    emitter: Arc<dyn EventEmitter>,
    max_generations: usize,
    isolate: bool,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(
        loader: Arc<dyn ToolModuleLoader>,
        emitter: Arc<dyn EventEmitter>,
        max_generations: usize,
        isolate: bool,
    ) -> Self {
        Self {
            loader,
            emitter,
            max_generations: max_generations.max(1),
            isolate,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn generation_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.generations.len())
            .unwrap_or(0)
    }

    pub fn contains(&self, revision: &RevisionRef) -> bool {
        self.state
            .lock()
            .map(|state| state.generations.contains_key(revision.as_str()))
            .unwrap_or(false)
    }

    pub async fn begin_turn(&self, revision: &RevisionRef) -> Result<(), EngineError> {
        self.ensure(revision)
            .await
            .map_err(|error| EngineError::InvalidConfiguration(error.to_string()))?;
        let mut state = self
            .lock()
            .map_err(|error| EngineError::InvalidConfiguration(error.to_string()))?;
        state.clock += 1;
        let stamp = state.clock;
        if let Some(generation) = state.generations.get_mut(revision.as_str()) {
            generation.in_flight_turns += 1;
            generation.last_used = stamp;
        }
        Ok(())
    }

    pub fn end_turn(&self, revision: &RevisionRef) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(generation) = state.generations.get_mut(revision.as_str()) {
            generation.in_flight_turns = generation.in_flight_turns.saturating_sub(1);
        }
        self.evict_idle(&mut state);
    }

    /// Dispatch one tool call into the generation for `revision`, creating it
    /// lazily. Infrastructure failures (module load, retired worker) surface
    /// as handler errors so the step folds them into an error tool result.
    pub async fn execute(
        &self,
        revision: &RevisionRef,
        package: &str,
        tool_name: &str,
        context: ToolContext,
        arguments: Value,
    ) -> Result<Value, ToolHandlerError> {
        self.ensure(revision).await?;

        let dispatch = {
            let mut state = self.lock()?;
            state.clock += 1;
            let stamp = state.clock;
            let Some(generation) = state.generations.get_mut(revision.as_str()) else {
                return Err(ToolHandlerError::new(
                    "WorkerRetiredError",
                    format!("generation for revision '{revision}' was retired"),
                ));
            };
            generation.in_flight_calls += 1;
            generation.last_used = stamp;
            match &generation.worker {
                Some(worker) => Dispatch::Remote(worker.tx.clone()),
                None => Dispatch::Local(generation.registry.clone()),
            }
        };

        let outcome = match dispatch {
            Dispatch::Remote(tx) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let request = WorkerRequest {
                    package: package.to_string(),
                    tool_name: tool_name.to_string(),
                    context,
                    arguments,
                    reply: reply_tx,
                };
                if tx.send(request).await.is_err() {
                    Err(ToolHandlerError::new(
                        "WorkerRetiredError",
                        format!("worker for revision '{revision}' is gone"),
                    ))
                } else {
                    match reply_rx.await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ToolHandlerError::new(
                            "WorkerRetiredError",
                            format!("worker for revision '{revision}' dropped the call"),
                        )),
                    }
                }
            }
            Dispatch::Local(registry) => match registry.get(package, tool_name) {
                Some(handler) => handler(context, arguments).await,
                None => Err(ToolHandlerError::new(
                    "HandlerNotFoundError",
                    format!("no handler registered for tool '{tool_name}' in package '{package}'"),
                )),
            },
        };

        if let Ok(mut state) = self.state.lock() {
            if let Some(generation) = state.generations.get_mut(revision.as_str()) {
                generation.in_flight_calls = generation.in_flight_calls.saturating_sub(1);
            }
            self.evict_idle(&mut state);
        }

        outcome
    }

    /// Drop every generation, rejecting any queued work.
    pub fn dispose(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        for (_, generation) in state.generations.drain() {
            if let Some(worker) = generation.worker {
                worker.task.abort();
            }
        }
    }

    async fn ensure(&self, revision: &RevisionRef) -> Result<(), ToolHandlerError> {
        if self.lock()?.generations.contains_key(revision.as_str()) {
            return Ok(());
        }

        let registry = self
            .loader
            .load(revision)
            .await
            .map_err(|error| ToolHandlerError::new("ToolModuleLoadError", error.to_string()))?;

        let mut state = self.lock()?;
        if !state.generations.contains_key(revision.as_str()) {
            let registry = Arc::new(registry);
            let worker = self.isolate.then(|| spawn_worker(registry.clone()));
            state.clock += 1;
            let stamp = state.clock;
            state.generations.insert(
                revision.as_str().to_string(),
                Generation {
                    registry,
                    worker,
                    in_flight_turns: 0,
                    in_flight_calls: 0,
                    last_used: stamp,
                },
            );
            let _ = self.emitter.emit(
                RuntimeEvent::new(EventKind::GenerationCreated, revision.as_str())
                    .with("revision", revision.as_str()),
            );
        }
        Ok(())
    }

    /// Runs only at safe points (post-call, post-turn). Generations with
    /// nonzero counters are never evicted regardless of age.
    fn evict_idle(&self, state: &mut PoolState) {
        while state.generations.len() > self.max_generations {
            let candidate = state
                .generations
                .iter()
                .filter(|(_, generation)| {
                    generation.in_flight_turns == 0 && generation.in_flight_calls == 0
                })
                .min_by_key(|(_, generation)| generation.last_used)
                .map(|(key, _)| key.clone());
            let Some(key) = candidate else {
                break;
            };
            if let Some(generation) = state.generations.remove(&key) {
                if let Some(worker) = generation.worker {
                    worker.task.abort();
                }
                let _ = self.emitter.emit(
                    RuntimeEvent::new(EventKind::GenerationEvicted, key.as_str())
                        .with("revision", key.as_str()),
                );
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState>, ToolHandlerError> {
        self.state
            .lock()
            .map_err(|_| ToolHandlerError::new("WorkerPoolError", "worker pool mutex poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_registry(_revision: &RevisionRef) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(
            "demo",
            "echo",
            Arc::new(|_context, arguments| {
                Box::pin(async move { Ok(json!({ "echo": arguments })) })
            }),
        );
        registry
    }

    fn pool(max_generations: usize, isolate: bool) -> WorkerPool {
        WorkerPool::new(
            Arc::new(StaticModuleLoader::new(echo_registry)),
            Arc::new(crate::events::NoopEventEmitter),
            max_generations,
            isolate,
        )
    }

    fn context(revision: &RevisionRef) -> ToolContext {
        ToolContext {
            tool_call_id: "call-1".to_string(),
            tool_name: "echo".to_string(),
            agent_name: "planner".to_string(),
            instance_key: "main".to_string(),
            turn_id: "turn-1".to_string(),
            trace_id: "trace-1".to_string(),
            step_id: "step-1".to_string(),
            revision: revision.clone(),
            state_snapshot: Value::Null,
            host: Arc::new(NoopWorkerHost),
            link: None,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn execute_dispatches_through_isolated_worker() {
        let pool = pool(2, true);
        let revision = RevisionRef::from_commit("aaa");
        pool.begin_turn(&revision).await.expect("begin turn");

        let output = pool
            .execute(&revision, "demo", "echo", context(&revision), json!({ "n": 1 }))
            .await
            .expect("execute");
        assert_eq!(output, json!({ "echo": { "n": 1 } }));

        pool.end_turn(&revision);
        assert!(pool.contains(&revision));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_handler_is_reported_without_retiring_the_generation() {
        let pool = pool(2, false);
        let revision = RevisionRef::from_commit("aaa");
        let error = pool
            .execute(&revision, "demo", "absent", context(&revision), json!({}))
            .await
            .expect_err("handler must be missing");
        assert_eq!(error.name, "HandlerNotFoundError");
        assert!(pool.contains(&revision));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn in_flight_generations_are_never_evicted() {
        let pool = pool(1, false);
        let rev_a = RevisionRef::from_commit("aaa");
        let rev_b = RevisionRef::from_commit("bbb");

        pool.begin_turn(&rev_a).await.expect("begin a");
        pool.begin_turn(&rev_b).await.expect("begin b");
        // Over the max, but both hold an in-flight turn.
        assert_eq!(pool.generation_count(), 2);

        pool.end_turn(&rev_a);
        assert!(!pool.contains(&rev_a));
        assert!(pool.contains(&rev_b));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn eviction_prefers_oldest_by_last_use() {
        let pool = pool(2, false);
        let rev_a = RevisionRef::from_commit("aaa");
        let rev_b = RevisionRef::from_commit("bbb");
        let rev_c = RevisionRef::from_commit("ccc");

        pool.begin_turn(&rev_a).await.expect("begin a");
        pool.end_turn(&rev_a);
        pool.begin_turn(&rev_b).await.expect("begin b");
        pool.end_turn(&rev_b);

        // Touch A so B becomes the least recently used.
        pool.execute(&rev_a, "demo", "echo", context(&rev_a), json!({}))
            .await
            .expect("touch a");

        pool.begin_turn(&rev_c).await.expect("begin c");
        pool.end_turn(&rev_c);

        assert!(pool.contains(&rev_a));
        assert!(!pool.contains(&rev_b));
        assert!(pool.contains(&rev_c));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn disposed_pool_recreates_generations_lazily() {
        let pool = pool(2, true);
        let revision = RevisionRef::from_commit("aaa");
        pool.begin_turn(&revision).await.expect("begin");
        pool.end_turn(&revision);
        pool.dispose();
        assert_eq!(pool.generation_count(), 0);

        let output = pool
            .execute(&revision, "demo", "echo", context(&revision), json!({ "n": 2 }))
            .await
            .expect("execute after dispose");
        assert_eq!(output, json!({ "echo": { "n": 2 } }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn commit_notifying_host_advances_revision_sink() {
        struct FixedHost;

        #[async_trait]
        impl WorkerHost for FixedHost {
            fn relay_log(&self, _level: &str, _message: &str) {}

            async fn open_changeset(
                &self,
                _reason: &str,
            ) -> Result<ChangesetHandle, ToolHandlerError> {
                Ok(ChangesetHandle {
                    changeset_id: "cs-1".to_string(),
                    base_revision: RevisionRef::from_commit("aaa"),
                    workdir: "/tmp/cs-1".to_string(),
                })
            }

            async fn commit_changeset(
                &self,
                _changeset_id: &str,
                _message: &str,
            ) -> Result<CommitOutcome, ToolHandlerError> {
                Ok(CommitOutcome {
                    new_revision: RevisionRef::from_commit("bbb"),
                })
            }
        }

        let seen: Arc<Mutex<Vec<RevisionRef>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let host = CommitNotifyingHost::new(
            Arc::new(FixedHost),
            Arc::new(move |revision| {
                sink.lock().expect("sink mutex").push(revision);
            }),
        );

        let handle = host.open_changeset("test").await.expect("open");
        let outcome = host
            .commit_changeset(&handle.changeset_id, "apply")
            .await
            .expect("commit");
        assert_eq!(outcome.new_revision.as_str(), "git:bbb");
        assert_eq!(
            seen.lock().expect("sink mutex").as_slice(),
            &[RevisionRef::from_commit("bbb")]
        );
    }
}
