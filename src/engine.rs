//! The transition state machine and the execution facade.
//!
//! The engine is step-driven: each activation reconstructs (or reuses) the
//! execution context, locates the cursor from the last transition's
//! `next`, interprets one step, and appends exactly one transition. Nested
//! control flow is pure cursor arithmetic over derived frame names; a
//! cursor whose step index equals the frame length is the end-of-workflow
//! sentinel and resolves to a frame-exit activation.

use chrono::Utc;
use serde_json::{Value, json};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use async_recursion::async_recursion;

use crate::backends::{CompletionBackend, GenericBackend, NativeBackend};
use crate::config::RookConfig;
use crate::context::ExecutionContext;
use crate::definition::{
    AgentDefinition, FrameKind, Step, TaskDefinition, owning_workflow, parse_frame,
};
use crate::dispatch::ToolDispatcher;
use crate::history::{ExecutionHistory, iter_base};
use crate::persistence::{TransitionRequest, TransitionStore};
use crate::tools::{NoReflection, SchemaReflector, resolve_catalog};
use crate::transition::{
    Cursor, Execution, ExecutionRecord, Transition, TransitionType, derive_status,
};
use crate::validate;

mod steps;

use steps::Outcome;

pub(crate) use steps::parse_iso8601_duration;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Workflow execution error: {message}"))]
    WorkflowExecution { message: String },

    #[snafu(display("Step execution error: {message}"))]
    StepExecution { message: String },

    #[snafu(display("Tool not found: {name}"))]
    UnknownTool { name: String },

    #[snafu(display("Workflow not found: {name}"))]
    UnknownWorkflow { name: String },

    #[snafu(display("Key not found in scratch store: {key}"))]
    KeyMissing { key: String },

    #[snafu(display("Auto-run tool loop exceeded depth {depth}"))]
    ToolLoopDepthExceeded { depth: u32 },

    #[snafu(display("Invalid prompt expression: {message}"))]
    InvalidPromptExpression { message: String },

    #[snafu(display("Cannot unwrap a response with {count} choices"))]
    UnwrapMultipleChoices { count: usize },

    #[snafu(display("Tool calls cannot be unwrapped"))]
    UnwrapToolCalls,

    #[snafu(display("Execution {execution_id} is not awaiting input"))]
    ResumeNotAwaiting { execution_id: Uuid },

    #[snafu(display("Cursor out of range: {workflow}[{step}]"))]
    CursorOutOfRange { workflow: String, step: usize },

    #[snafu(display("Activity '{activity}' timed out"))]
    ActivityTimeout { activity: String },

    #[snafu(display("Activity '{activity}' was cancelled"))]
    ActivityCancelled { activity: String },

    #[snafu(display("Execution not found: {execution_id}"))]
    ExecutionNotFound { execution_id: Uuid },

    #[snafu(display("Expression error: {source}"))]
    Expression { source: crate::expressions::Error },

    #[snafu(display("Persistence error: {source}"))]
    Persistence { source: crate::persistence::Error },

    #[snafu(display("Definition error: {source}"))]
    Definition { source: crate::definition::Error },

    #[snafu(display("Tool catalog error: {source}"))]
    Tools { source: crate::tools::Error },

    #[snafu(display("Backend error: {source}"))]
    Backend { source: crate::backends::Error },

    #[snafu(display("Tool dispatch error: {source}"))]
    Dispatch { source: crate::dispatch::Error },

    #[snafu(display("Validation error: {source}"))]
    Validation { source: crate::validate::Error },

    #[snafu(display("Serialization error: {source}"))]
    Serialization { source: serde_json::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<crate::expressions::Error> for Error {
    fn from(source: crate::expressions::Error) -> Self {
        Error::Expression { source }
    }
}

impl From<crate::persistence::Error> for Error {
    fn from(source: crate::persistence::Error) -> Self {
        Error::Persistence { source }
    }
}

impl From<crate::definition::Error> for Error {
    fn from(source: crate::definition::Error) -> Self {
        Error::Definition { source }
    }
}

impl From<crate::tools::Error> for Error {
    fn from(source: crate::tools::Error) -> Self {
        Error::Tools { source }
    }
}

impl From<crate::backends::Error> for Error {
    fn from(source: crate::backends::Error) -> Self {
        Error::Backend { source }
    }
}

impl From<crate::dispatch::Error> for Error {
    fn from(source: crate::dispatch::Error) -> Self {
        Error::Dispatch { source }
    }
}

impl From<crate::validate::Error> for Error {
    fn from(source: crate::validate::Error) -> Self {
        Error::Validation { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Error::Serialization { source }
    }
}

fn bump(cursor: &Cursor) -> Cursor {
    Cursor::new(cursor.workflow.clone(), cursor.step + 1)
}

pub struct TaskEngine {
    store: Arc<dyn TransitionStore>,
    generic: Arc<dyn CompletionBackend>,
    native: Arc<dyn CompletionBackend>,
    dispatcher: Arc<ToolDispatcher>,
    reflector: Arc<dyn SchemaReflector>,
    config: RookConfig,
    /// Advisory context snapshots; the log stays authoritative.
    contexts: RwLock<HashMap<Uuid, ExecutionContext>>,
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("store", &self.store)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl TaskEngine {
    pub fn new(store: Arc<dyn TransitionStore>, config: RookConfig) -> Self {
        let generic = GenericBackend::new(config.backends.openai_api_key.clone())
            .base_url(config.backends.openai_base_url.clone());
        let native = NativeBackend::new(config.backends.anthropic_api_key.clone())
            .base_url(config.backends.anthropic_base_url.clone())
            .max_tokens(config.engine.native_max_tokens);
        Self {
            store,
            generic: Arc::new(generic),
            native: Arc::new(native),
            dispatcher: Arc::new(ToolDispatcher::new()),
            reflector: Arc::new(NoReflection),
            config,
            contexts: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_generic_backend(mut self, backend: Arc<dyn CompletionBackend>) -> Self {
        self.generic = backend;
        self
    }

    #[must_use]
    pub fn with_native_backend(mut self, backend: Arc<dyn CompletionBackend>) -> Self {
        self.native = backend;
        self
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: ToolDispatcher) -> Self {
        self.dispatcher = Arc::new(dispatcher);
        self
    }

    #[must_use]
    pub fn with_reflector(mut self, reflector: Arc<dyn SchemaReflector>) -> Self {
        self.reflector = reflector;
        self
    }

    pub fn config(&self) -> &RookConfig {
        &self.config
    }

    pub(crate) fn dispatcher(&self) -> Arc<ToolDispatcher> {
        self.dispatcher.clone()
    }

    pub(crate) fn reflector(&self) -> &dyn SchemaReflector {
        self.reflector.as_ref()
    }

    pub(crate) fn generic_backend(&self) -> Arc<dyn CompletionBackend> {
        self.generic.clone()
    }

    pub(crate) fn native_backend(&self) -> Arc<dyn CompletionBackend> {
        self.native.clone()
    }

    /// Errors that should propagate to the caller instead of being
    /// recorded as an `error` transition.
    fn is_infrastructure(error: &Error) -> bool {
        matches!(
            error,
            Error::Persistence { .. } | Error::ExecutionNotFound { .. }
        )
    }

    async fn record(&self, execution_id: Uuid) -> Result<ExecutionRecord> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or(Error::ExecutionNotFound { execution_id })
    }

    /// Fetch the cached context or rebuild it from the transition log.
    async fn context(&self, record: &ExecutionRecord) -> Result<ExecutionContext> {
        if let Some(ctx) = self.contexts.read().await.get(&record.id) {
            return Ok(ctx.clone());
        }

        debug!(execution_id = %record.id, "rebuilding context from transition log");
        let tools = resolve_catalog(
            &record.agent.tools,
            &record.task.tools,
            record.task.inherit_tools,
        );
        let ctx = ExecutionContext::new(record, tools);
        let transitions = self.store.list(record.id).await?;
        ExecutionHistory::new(transitions).replay(&ctx).await;
        self.contexts.write().await.insert(record.id, ctx.clone());
        Ok(ctx)
    }

    /// Append a transition; if the log already ended (a cancel raced with
    /// this activation), return the existing terminal transition instead.
    async fn append_or_terminal(&self, request: TransitionRequest) -> Result<Transition> {
        let execution_id = request.execution_id;
        match self.store.append(request).await {
            Ok(t) => Ok(t),
            Err(crate::persistence::Error::PostTerminal { .. }) => self
                .store
                .latest(execution_id)
                .await?
                .ok_or(Error::ExecutionNotFound { execution_id }),
            Err(e) => Err(e.into()),
        }
    }

    /// Create an execution: validate, register, and record `init`. An
    /// empty `main` finishes immediately with a null output.
    pub async fn start(
        &self,
        task: TaskDefinition,
        agent: AgentDefinition,
        input: Value,
    ) -> Result<(Uuid, Uuid)> {
        validate::validate_task(&task, &agent)?;
        self.start_with_parts(task, agent, input, serde_json::Map::new(), serde_json::Map::new())
            .await
    }

    async fn start_with_parts(
        &self,
        task: TaskDefinition,
        agent: AgentDefinition,
        input: Value,
        initial_state: serde_json::Map<String, Value>,
        locals: serde_json::Map<String, Value>,
    ) -> Result<(Uuid, Uuid)> {
        let id = Uuid::new_v4();
        let record = ExecutionRecord {
            id,
            task,
            agent,
            input: input.clone(),
            initial_state,
            locals,
            created_at: Utc::now(),
        };
        self.store.save_execution(record.clone()).await?;

        let tools = resolve_catalog(
            &record.agent.tools,
            &record.task.tools,
            record.task.inherit_tools,
        );
        let ctx = ExecutionContext::new(&record, tools);
        self.contexts.write().await.insert(id, ctx);

        let empty = record.task.main.is_empty();
        let init = self
            .store
            .append(TransitionRequest {
                execution_id: id,
                ty: TransitionType::Init,
                current: Cursor::new("main", 0),
                next: (!empty).then(|| Cursor::new("main", 0)),
                output: input,
                metadata: serde_json::Map::new(),
            })
            .await?;

        let last = if empty {
            self.store
                .append(TransitionRequest {
                    execution_id: id,
                    ty: TransitionType::Finish,
                    current: Cursor::new("main", 0),
                    next: None,
                    output: Value::Null,
                    metadata: serde_json::Map::new(),
                })
                .await?
        } else {
            init
        };

        Ok((id, last.id))
    }

    /// Advance one step. Idempotent per log position: after a terminal
    /// transition this is a no-op returning the terminal transition id,
    /// and while awaiting input it returns the `wait` transition id.
    #[async_recursion(?Send)]
    pub async fn step(&self, execution_id: Uuid) -> Result<Uuid> {
        let record = self.record(execution_id).await?;
        let latest = self
            .store
            .latest(execution_id)
            .await?
            .ok_or(Error::ExecutionNotFound { execution_id })?;

        if latest.ty.is_terminal() {
            return Ok(latest.id);
        }

        if latest.ty == TransitionType::Wait {
            match latest.metadata_str("reason") {
                Some("sleep") => {
                    let wake = latest
                        .metadata_str("sleep_until")
                        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok());
                    if let Some(wake) = wake
                        && Utc::now() < wake.with_timezone(&Utc)
                    {
                        return Ok(latest.id);
                    }
                }
                _ => return Ok(latest.id),
            }
        }

        let ctx = self.context(&record).await?;

        if let Some(reason) = ctx.cancelled.read().await.clone() {
            let t = self
                .append_or_terminal(TransitionRequest {
                    execution_id,
                    ty: TransitionType::Cancelled,
                    current: latest.next.clone().unwrap_or(latest.current.clone()),
                    next: None,
                    output: json!(reason),
                    metadata: serde_json::Map::new(),
                })
                .await?;
            return Ok(t.id);
        }

        let cursor = latest.next.clone().ok_or_else(|| Error::WorkflowExecution {
            message: format!("execution {execution_id} has no cursor to advance"),
        })?;

        let result = self.activate(&ctx, &record, &cursor).await;

        match result {
            Ok(t) => Ok(t.id),
            Err(e) if Self::is_infrastructure(&e) => Err(e),
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "step failed, recording error transition");
                let t = self
                    .append_or_terminal(TransitionRequest {
                        execution_id,
                        ty: TransitionType::Error,
                        current: cursor,
                        next: None,
                        output: json!(e.to_string()),
                        metadata: serde_json::Map::new(),
                    })
                    .await?;
                Ok(t.id)
            }
        }
    }

    /// One activation: either a frame exit (sentinel cursor) or a step
    /// interpretation.
    async fn activate(
        &self,
        ctx: &ExecutionContext,
        record: &ExecutionRecord,
        cursor: &Cursor,
    ) -> Result<Transition> {
        let frame_len = record.task.resolve_steps(&cursor.workflow)?.len();

        if cursor.step > frame_len {
            return Err(Error::CursorOutOfRange {
                workflow: cursor.workflow.clone(),
                step: cursor.step,
            });
        }
        if cursor.step == frame_len {
            return self.apply_frame_end(ctx, record, cursor).await;
        }

        let step = record.task.step_at(&cursor.workflow, cursor.step)?.clone();
        debug!(execution_id = %ctx.execution_id, cursor = %cursor, kind = step.kind(), "interpreting step");

        let outcome = steps::interpret(self, ctx, cursor, &step).await?;
        self.apply_outcome(ctx, cursor, step.kind(), outcome).await
    }

    async fn apply_outcome(
        &self,
        ctx: &ExecutionContext,
        cursor: &Cursor,
        kind: &'static str,
        outcome: Outcome,
    ) -> Result<Transition> {
        let execution_id = ctx.execution_id;
        let mut metadata = serde_json::Map::new();
        metadata.insert("step_kind".to_string(), json!(kind));

        let request = match outcome {
            Outcome::Continue { output } => {
                ctx.record_output(&cursor.workflow, cursor.step, output.clone())
                    .await;
                TransitionRequest {
                    execution_id,
                    ty: TransitionType::Step,
                    current: cursor.clone(),
                    next: Some(bump(cursor)),
                    output,
                    metadata,
                }
            }
            Outcome::Jump {
                frame,
                locals,
                items,
            } => {
                ctx.set_locals(&frame, locals.clone()).await;
                if let Some(items) = &items {
                    ctx.set_items(&iter_base(cursor, kind), items.clone()).await;
                    metadata.insert("items".to_string(), Value::Array(items.clone()));
                }
                metadata.insert("frame_locals".to_string(), Value::Object(locals));
                TransitionRequest {
                    execution_id,
                    ty: TransitionType::Step,
                    current: cursor.clone(),
                    next: Some(Cursor::new(frame, 0)),
                    output: Value::Null,
                    metadata,
                }
            }
            Outcome::Call {
                workflow,
                arguments,
            } => {
                ctx.call_stack.write().await.push(cursor.clone());
                let mut locals = serde_json::Map::new();
                locals.insert("input".to_string(), arguments.clone());
                locals.insert("seed".to_string(), arguments.clone());
                ctx.set_locals(&workflow, locals.clone()).await;
                metadata.insert("call".to_string(), json!(true));
                metadata.insert("frame_locals".to_string(), Value::Object(locals));
                TransitionRequest {
                    execution_id,
                    ty: TransitionType::Step,
                    current: cursor.clone(),
                    next: Some(Cursor::new(workflow, 0)),
                    output: arguments,
                    metadata,
                }
            }
            Outcome::Return { value } => {
                return self.apply_return(ctx, cursor, value, metadata).await;
            }
            Outcome::Sleep { duration } => {
                let wake = Utc::now()
                    + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
                metadata.insert("reason".to_string(), json!("sleep"));
                metadata.insert("sleep_until".to_string(), json!(wake.to_rfc3339()));
                ctx.record_output(&cursor.workflow, cursor.step, Value::Null)
                    .await;
                TransitionRequest {
                    execution_id,
                    ty: TransitionType::Wait,
                    current: cursor.clone(),
                    next: Some(bump(cursor)),
                    output: Value::Null,
                    metadata,
                }
            }
            Outcome::AwaitInput { info } => {
                metadata.insert("reason".to_string(), json!("input"));
                metadata.insert("info".to_string(), info.clone());
                TransitionRequest {
                    execution_id,
                    ty: TransitionType::Wait,
                    current: cursor.clone(),
                    next: Some(bump(cursor)),
                    output: info,
                    metadata,
                }
            }
            Outcome::Fail { message } => TransitionRequest {
                execution_id,
                ty: TransitionType::Error,
                current: cursor.clone(),
                next: None,
                output: json!(message),
                metadata,
            },
        };

        self.append_or_terminal(request).await
    }

    /// A `return` terminates the owning workflow: `main` finishes the
    /// execution, a yielded workflow pops back to its call site.
    async fn apply_return(
        &self,
        ctx: &ExecutionContext,
        cursor: &Cursor,
        value: Value,
        mut metadata: serde_json::Map<String, Value>,
    ) -> Result<Transition> {
        let execution_id = ctx.execution_id;
        let owner = owning_workflow(&cursor.workflow).to_string();

        if owner == "main" {
            return self
                .append_or_terminal(TransitionRequest {
                    execution_id,
                    ty: TransitionType::Finish,
                    current: cursor.clone(),
                    next: None,
                    output: value,
                    metadata,
                })
                .await;
        }

        let site = ctx
            .call_stack
            .write()
            .await
            .pop()
            .ok_or_else(|| Error::WorkflowExecution {
                message: format!("return from '{owner}' with no call site on the stack"),
            })?;
        ctx.record_output(&site.workflow, site.step, value.clone())
            .await;
        metadata.insert("pop".to_string(), json!(true));

        self.append_or_terminal(TransitionRequest {
            execution_id,
            ty: TransitionType::Step,
            current: cursor.clone(),
            next: Some(bump(&site)),
            output: value,
            metadata,
        })
        .await
    }

    /// A cursor at the end of a frame: finish the execution, pop a yield,
    /// close a branch, or advance an iteration.
    async fn apply_frame_end(
        &self,
        ctx: &ExecutionContext,
        record: &ExecutionRecord,
        cursor: &Cursor,
    ) -> Result<Transition> {
        let execution_id = ctx.execution_id;
        let frame = cursor.workflow.clone();
        let mut metadata = serde_json::Map::new();

        // A plain workflow ran off its end.
        if record.task.workflow(&frame).is_some() {
            let output = ctx.last_output(&frame).await.unwrap_or(Value::Null);

            if frame == "main" {
                return self
                    .append_or_terminal(TransitionRequest {
                        execution_id,
                        ty: TransitionType::Finish,
                        current: cursor.clone(),
                        next: None,
                        output,
                        metadata,
                    })
                    .await;
            }

            let site = ctx
                .call_stack
                .write()
                .await
                .pop()
                .ok_or_else(|| Error::WorkflowExecution {
                    message: format!("workflow '{frame}' ended with no call site on the stack"),
                })?;
            ctx.record_output(&site.workflow, site.step, output.clone())
                .await;
            metadata.insert("step_kind".to_string(), json!("yield"));
            metadata.insert("pop".to_string(), json!(true));
            return self
                .append_or_terminal(TransitionRequest {
                    execution_id,
                    ty: TransitionType::Step,
                    current: site.clone(),
                    next: Some(bump(&site)),
                    output,
                    metadata,
                })
                .await;
        }

        let (parent, index, kind) =
            parse_frame(&frame).ok_or_else(|| Error::UnknownWorkflow { name: frame.clone() })?;
        let parent_cursor = Cursor::new(parent, index);
        let parent_step = record.task.step_at(parent, index)?.clone();

        match kind {
            FrameKind::Then | FrameKind::Else | FrameKind::Case(_) => {
                // The branch's last output becomes the control step's output.
                let output = ctx.last_output(&frame).await.unwrap_or(Value::Null);
                ctx.record_output(&parent_cursor.workflow, parent_cursor.step, output.clone())
                    .await;
                metadata.insert("step_kind".to_string(), json!(parent_step.kind()));
                self.append_or_terminal(TransitionRequest {
                    execution_id,
                    ty: TransitionType::Step,
                    current: parent_cursor.clone(),
                    next: Some(bump(&parent_cursor)),
                    output,
                    metadata,
                })
                .await
            }
            FrameKind::Iter(i) | FrameKind::MapIter(i) => {
                let step_kind = parent_step.kind();
                let base = iter_base(&parent_cursor, step_kind);
                let iteration_output = ctx.last_output(&frame).await.unwrap_or(Value::Null);
                ctx.record_output(&base, i, iteration_output.clone()).await;
                metadata.insert("step_kind".to_string(), json!(step_kind));
                metadata.insert("iteration".to_string(), json!(i));
                metadata.insert(
                    "iteration_output".to_string(),
                    iteration_output.clone(),
                );

                let items = ctx.items(&base).await.ok_or_else(|| Error::WorkflowExecution {
                    message: format!("iteration collection for '{base}' was not recorded"),
                })?;

                if i + 1 < items.len() {
                    let next_frame = format!("{base}[{}]", i + 1);
                    let locals = steps::iteration_locals(&items[i + 1], i + 1);
                    ctx.set_locals(&next_frame, locals.clone()).await;
                    metadata.insert("frame_locals".to_string(), Value::Object(locals));
                    return self
                        .append_or_terminal(TransitionRequest {
                            execution_id,
                            ty: TransitionType::Step,
                            current: parent_cursor,
                            next: Some(Cursor::new(next_frame, 0)),
                            output: iteration_output,
                            metadata,
                        })
                        .await;
                }

                // Last iteration: collect, and fold when the step reduces.
                let collected = ctx.frame_outputs(&base).await;
                let output = if let Step::Map(map_step) = &parent_step {
                    let scope = ctx.scope(&parent_cursor.workflow).await;
                    steps::fold_reduce(
                        map_step.reduce.as_deref(),
                        map_step.initial.as_deref(),
                        collected,
                        &scope,
                    )?
                } else {
                    Value::Array(collected)
                };

                ctx.record_output(&parent_cursor.workflow, parent_cursor.step, output.clone())
                    .await;
                self.append_or_terminal(TransitionRequest {
                    execution_id,
                    ty: TransitionType::Step,
                    current: parent_cursor.clone(),
                    next: Some(bump(&parent_cursor)),
                    output,
                    metadata,
                })
                .await
            }
            FrameKind::Branch(_) => Err(Error::WorkflowExecution {
                message: format!("parallel branch frame '{frame}' cannot end inline"),
            }),
        }
    }

    /// Drive the execution until it terminates or suspends for input,
    /// sleeping through `sleep` waits.
    pub async fn run(&self, execution_id: Uuid) -> Result<Transition> {
        loop {
            self.step(execution_id).await?;
            let latest = self
                .store
                .latest(execution_id)
                .await?
                .ok_or(Error::ExecutionNotFound { execution_id })?;

            if latest.ty.is_terminal() {
                return Ok(latest);
            }
            if latest.ty == TransitionType::Wait {
                match latest.metadata_str("reason") {
                    Some("sleep") => {
                        let wake = latest
                            .metadata_str("sleep_until")
                            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok());
                        if let Some(wake) = wake {
                            let remaining = (wake.with_timezone(&Utc) - Utc::now())
                                .to_std()
                                .unwrap_or_default();
                            tokio::time::sleep(remaining).await;
                        }
                    }
                    _ => return Ok(latest),
                }
            }
        }
    }

    /// Resume an execution that is awaiting input. The provided map is
    /// merged over the execution input and recorded as the `resume`
    /// transition's output.
    pub async fn resume(&self, execution_id: Uuid, input: Value) -> Result<Uuid> {
        let record = self.record(execution_id).await?;
        let latest = self
            .store
            .latest(execution_id)
            .await?
            .ok_or(Error::ExecutionNotFound { execution_id })?;

        let awaiting = latest.ty == TransitionType::Wait
            && latest.metadata_str("reason") == Some("input");
        if !awaiting {
            return Err(Error::ResumeNotAwaiting { execution_id });
        }

        let ctx = self.context(&record).await?;
        ctx.merge_input(&input).await;
        ctx.record_output(&latest.current.workflow, latest.current.step, input.clone())
            .await;

        let t = self
            .store
            .append(TransitionRequest {
                execution_id,
                ty: TransitionType::Resume,
                current: latest.current.clone(),
                next: latest.next.clone(),
                output: input,
                metadata: serde_json::Map::new(),
            })
            .await?;
        Ok(t.id)
    }

    /// Request cancellation. Terminal executions are untouched (cancelling
    /// an already-cancelled execution is a no-op); in-flight children get
    /// a best-effort cancel signal.
    #[async_recursion(?Send)]
    pub async fn cancel(&self, execution_id: Uuid, reason: Option<String>) -> Result<Uuid> {
        let latest = self
            .store
            .latest(execution_id)
            .await?
            .ok_or(Error::ExecutionNotFound { execution_id })?;
        if latest.ty.is_terminal() {
            return Ok(latest.id);
        }

        let reason = reason.unwrap_or_else(|| "execution cancelled".to_string());

        let children = {
            let contexts = self.contexts.read().await;
            match contexts.get(&execution_id) {
                Some(ctx) => {
                    *ctx.cancelled.write().await = Some(reason.clone());
                    ctx.children.read().await.clone()
                }
                None => Vec::new(),
            }
        };
        for child in children {
            if let Err(e) = self.cancel(child, Some(reason.clone())).await {
                warn!(child = %child, error = %e, "failed to cancel child execution");
            }
        }

        let t = self
            .append_or_terminal(TransitionRequest {
                execution_id,
                ty: TransitionType::Cancelled,
                current: latest.next.clone().unwrap_or(latest.current),
                next: None,
                output: json!(reason),
                metadata: serde_json::Map::new(),
            })
            .await?;
        Ok(t.id)
    }

    /// The derived execution view.
    pub async fn status(&self, execution_id: Uuid) -> Result<Execution> {
        let record = self.record(execution_id).await?;
        let latest = self.store.latest(execution_id).await?;
        let status = derive_status(latest.as_ref());

        let (output, error) = match &latest {
            Some(t) if t.ty == TransitionType::Finish => (Some(t.output.clone()), None),
            Some(t) if t.ty == TransitionType::Error || t.ty == TransitionType::Cancelled => (
                None,
                Some(
                    t.output
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| t.output.to_string()),
                ),
            ),
            _ => (None, None),
        };

        Ok(Execution {
            id: record.id,
            task_id: record.task.id,
            status,
            input: record.input,
            output,
            error,
            created_at: record.created_at,
            updated_at: latest.map(|t| t.updated_at).unwrap_or(record.created_at),
        })
    }

    /// The full transition log, for diagnosis.
    pub async fn history(&self, execution_id: Uuid) -> Result<Vec<Transition>> {
        Ok(self.store.list(execution_id).await?)
    }

    /// Spawn a child execution for a parallel branch or mapped element.
    /// The child inherits the task's sibling workflows, tools, and the
    /// parent's scratch state snapshot.
    pub(crate) async fn spawn_child(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        steps: Vec<Step>,
        input: Value,
        locals: serde_json::Map<String, Value>,
    ) -> Result<Uuid> {
        let task = TaskDefinition {
            id: ctx.task.id,
            name: name.to_string(),
            description: String::new(),
            main: steps,
            workflows: ctx.task.workflows.clone(),
            tools: ctx.task.tools.clone(),
            inherit_tools: ctx.task.inherit_tools,
        };
        let initial_state = ctx.state.read().await.clone();
        let (child_id, _) = self
            .start_with_parts(task, (*ctx.agent).clone(), input, initial_state, locals)
            .await?;
        ctx.children.write().await.push(child_id);
        Ok(child_id)
    }

    /// Drive a child to completion. Children cannot suspend for input;
    /// a `wait_for_input` inside a branch is an error.
    pub(crate) async fn run_child(&self, execution_id: Uuid) -> Result<Value> {
        loop {
            self.step(execution_id).await?;
            let latest = self
                .store
                .latest(execution_id)
                .await?
                .ok_or(Error::ExecutionNotFound { execution_id })?;

            match latest.ty {
                TransitionType::Finish => return Ok(latest.output),
                TransitionType::Error => {
                    return Err(Error::StepExecution {
                        message: latest
                            .output
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| latest.output.to_string()),
                    });
                }
                TransitionType::Cancelled => {
                    return Err(Error::ActivityCancelled {
                        activity: format!("child:{execution_id}"),
                    });
                }
                TransitionType::Wait => match latest.metadata_str("reason") {
                    Some("sleep") => {
                        let wake = latest
                            .metadata_str("sleep_until")
                            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok());
                        if let Some(wake) = wake {
                            let remaining = (wake.with_timezone(&Utc) - Utc::now())
                                .to_std()
                                .unwrap_or_default();
                            tokio::time::sleep(remaining).await;
                        }
                    }
                    _ => {
                        self.cancel(execution_id, Some("branch suspended".to_string()))
                            .await?;
                        return Err(Error::StepExecution {
                            message: "wait_for_input is not supported inside parallel branches"
                                .to_string(),
                        });
                    }
                },
                TransitionType::Init | TransitionType::Step | TransitionType::Resume => {}
            }
        }
    }

    /// Retry wrapper for tool and prompt activities. The schedule-to-close
    /// timeout bounds the whole call including retries; the heartbeat
    /// timeout bounds each attempt. Cancellation is observed between
    /// attempts.
    pub(crate) async fn with_retry<T, F, Fut>(
        &self,
        ctx: &ExecutionContext,
        activity: &str,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.engine.retry_max_attempts.max(1);
        let heartbeat =
            std::time::Duration::from_secs(self.config.engine.heartbeat_timeout_secs.max(1));
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_secs(self.config.engine.schedule_to_close_timeout_secs);

        let mut last_error = None;
        for attempt_index in 0..max_attempts {
            if ctx.is_cancelled().await {
                return Err(Error::ActivityCancelled {
                    activity: activity.to_string(),
                });
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                last_error = Some(Error::ActivityTimeout {
                    activity: activity.to_string(),
                });
                break;
            }

            match tokio::time::timeout(remaining.min(heartbeat), attempt()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    warn!(activity, attempt = attempt_index + 1, error = %e, "activity attempt failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(activity, attempt = attempt_index + 1, "activity attempt timed out");
                    last_error = Some(Error::ActivityTimeout {
                        activity: activity.to_string(),
                    });
                }
            }

            if attempt_index + 1 < max_attempts {
                let backoff = std::time::Duration::from_millis(100 * 2u64.pow(attempt_index));
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_error.unwrap_or(Error::ActivityTimeout {
            activity: activity.to_string(),
        }))
    }
}
