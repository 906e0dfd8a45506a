//! Reconstruction of execution context from the transition log.
//!
//! The log is authoritative: every piece of mutable context (scratch
//! state, frame outputs, loop bindings, call stack, cursor) is recoverable
//! by replaying the recorded transitions in order. Replay never re-executes
//! effects; it only reads recorded outputs, so a rebuilt context is
//! deterministic regardless of clocks, ids, or tool behavior.

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::transition::{Cursor, ExecutionStatus, Transition, TransitionType, derive_status};

/// The replayable view over one execution's transitions.
pub struct ExecutionHistory {
    transitions: Vec<Transition>,
}

/// Frame base for iteration results, derived from the control step's
/// cursor and kind (`main[1].iter`, `main[0].map`).
pub fn iter_base(cursor: &Cursor, step_kind: &str) -> String {
    let suffix = if step_kind == "map" { "map" } else { "iter" };
    format!("{}[{}].{}", cursor.workflow, cursor.step, suffix)
}

impl ExecutionHistory {
    pub fn new(transitions: Vec<Transition>) -> Self {
        Self { transitions }
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn latest(&self) -> Option<&Transition> {
        self.transitions.last()
    }

    pub fn status(&self) -> ExecutionStatus {
        derive_status(self.latest())
    }

    pub fn is_terminal(&self) -> bool {
        self.latest().is_some_and(|t| t.ty.is_terminal())
    }

    /// Where the next activation picks up: the latest transition's `next`.
    pub fn cursor(&self) -> Option<Cursor> {
        self.latest().and_then(|t| t.next.clone())
    }

    /// The terminal result, if the execution finished.
    pub fn output(&self) -> Option<&Value> {
        self.latest().and_then(|t| {
            if t.ty.is_terminal() {
                Some(&t.output)
            } else {
                None
            }
        })
    }

    /// Rebuild the mutable context from the log.
    pub async fn replay(&self, ctx: &ExecutionContext) {
        for t in &self.transitions {
            match t.ty {
                TransitionType::Init => {
                    *ctx.input.write().await = t.output.clone();
                }
                TransitionType::Resume => {
                    ctx.merge_input(&t.output).await;
                    ctx.record_output(&t.current.workflow, t.current.step, t.output.clone())
                        .await;
                }
                TransitionType::Step => {
                    self.replay_step(ctx, t).await;
                }
                TransitionType::Wait => {
                    // A sleep records its (null) output when appended; an
                    // input wait gets its output from the resume.
                    if t.metadata_str("reason") == Some("sleep") {
                        ctx.record_output(&t.current.workflow, t.current.step, t.output.clone())
                            .await;
                    }
                }
                TransitionType::Finish
                | TransitionType::Error
                | TransitionType::Cancelled => {}
            }
        }
    }

    async fn replay_step(&self, ctx: &ExecutionContext, t: &Transition) {
        // A pop records the yielded workflow's result as the yield step's
        // output; the popped cursor is the current call-stack top.
        if t.metadata.get("pop").and_then(Value::as_bool) == Some(true) {
            let popped = ctx.call_stack.write().await.pop();
            if let Some(site) = popped {
                ctx.record_output(&site.workflow, site.step, t.output.clone())
                    .await;
            }
        }

        ctx.record_output(&t.current.workflow, t.current.step, t.output.clone())
            .await;

        if t.metadata_str("step_kind") == Some("set")
            && let Some(bindings) = t.output.as_object()
        {
            for (key, value) in bindings {
                ctx.set_state(key, value.clone()).await;
            }
        }

        if t.metadata.get("call").and_then(Value::as_bool) == Some(true) {
            ctx.call_stack.write().await.push(t.current.clone());
        }

        if let Some(next) = &t.next {
            if let Some(locals) = t.metadata.get("frame_locals").and_then(Value::as_object) {
                ctx.set_locals(&next.workflow, locals.clone()).await;
            }
            if let Some(items) = t.metadata.get("items").and_then(Value::as_array) {
                let kind = t.metadata_str("step_kind").unwrap_or("foreach");
                ctx.set_items(&iter_base(&t.current, kind), items.clone())
                    .await;
            }
        }

        // Per-iteration results live under the frame base so the final
        // collection is recoverable mid-loop.
        if let Some(iteration) = t.metadata.get("iteration").and_then(Value::as_u64)
            && let Some(result) = t.metadata.get("iteration_output")
        {
            let kind = t.metadata_str("step_kind").unwrap_or("foreach");
            ctx.record_output(
                &iter_base(&t.current, kind),
                iteration as usize,
                result.clone(),
            )
            .await;
        }
    }
}
