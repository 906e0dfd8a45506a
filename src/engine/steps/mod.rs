//! Per-kind step interpretation.
//!
//! `interpret` is the dispatch table over step kinds: it evaluates the
//! step's inputs against the execution context and produces an [`Outcome`]
//! that the state machine translates into exactly one transition.

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::definition::Step;
use crate::transition::Cursor;

use super::{Result, TaskEngine};

mod branch;
mod iteration;
mod parallel;
mod prompt;
mod simple;
mod tool_call;
mod wait;

pub(crate) use iteration::{fold_reduce, iteration_locals};
pub(crate) use wait::parse_iso8601_duration;

/// What a step evaluation decided. The state machine owns the translation
/// into transitions and cursor movement.
#[derive(Debug)]
pub enum Outcome {
    /// The step produced an output; move to the following step.
    Continue { output: Value },
    /// Enter a derived frame (branch body, iteration body) at step 0.
    Jump {
        frame: String,
        locals: serde_json::Map<String, Value>,
        /// The evaluated collection, recorded once on loop entry.
        items: Option<Vec<Value>>,
    },
    /// Invoke a sibling workflow; the cursor pushes a return site.
    Call { workflow: String, arguments: Value },
    /// Terminate the owning workflow with a value.
    Return { value: Value },
    /// Suspend for wall time.
    Sleep { duration: std::time::Duration },
    /// Suspend pending external resume.
    AwaitInput { info: Value },
    /// Terminate the execution with an error.
    Fail { message: String },
}

pub(crate) async fn interpret(
    engine: &TaskEngine,
    ctx: &ExecutionContext,
    cursor: &Cursor,
    step: &Step,
) -> Result<Outcome> {
    match step {
        Step::Evaluate(bindings) => simple::exec_evaluate(ctx, cursor, bindings).await,
        Step::Set(bindings) => simple::exec_set(ctx, cursor, bindings).await,
        Step::Get(key) => simple::exec_get(ctx, key).await,
        Step::Log(template) => simple::exec_log(ctx, cursor, template).await,
        Step::Return(bindings) => simple::exec_return(ctx, cursor, bindings).await,
        Step::Error(message) => Ok(Outcome::Fail {
            message: message.clone(),
        }),
        Step::Yield {
            workflow,
            arguments,
        } => simple::exec_yield(ctx, cursor, workflow, arguments).await,
        Step::Sleep(duration) => wait::exec_sleep(duration),
        Step::WaitForInput { info } => wait::exec_wait_for_input(ctx, cursor, info).await,
        Step::IfElse {
            condition,
            then,
            otherwise,
        } => branch::exec_if_else(ctx, cursor, condition, then, otherwise).await,
        Step::Switch(cases) => branch::exec_switch(ctx, cursor, cases).await,
        Step::Foreach { collection, body } => {
            iteration::exec_foreach(ctx, cursor, collection, body).await
        }
        Step::Map(map_step) => iteration::exec_map(engine, ctx, cursor, map_step).await,
        Step::Parallel(branches) => parallel::exec_parallel(engine, ctx, cursor, branches).await,
        Step::ToolCall { tool, arguments } => {
            tool_call::exec_tool_call(engine, ctx, cursor, tool, arguments).await
        }
        Step::Prompt(prompt_step) => prompt::exec_prompt(engine, ctx, cursor, prompt_step).await,
    }
}
