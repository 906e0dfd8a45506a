//! Conditional branching: `if_else` and `switch`.

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::definition::{FrameKind, Step, SwitchCase, frame_name};
use crate::expressions;
use crate::transition::Cursor;

use super::Outcome;
use super::super::Result;

/// The `_` binding a branch body starts from: the last output at the
/// branch point.
async fn branch_seed(ctx: &ExecutionContext, cursor: &Cursor) -> serde_json::Map<String, Value> {
    let scope = ctx.scope(&cursor.workflow).await;
    let mut locals = serde_json::Map::new();
    if let Some(last) = scope.get("_") {
        locals.insert("seed".to_string(), last.clone());
    }
    locals
}

pub async fn exec_if_else(
    ctx: &ExecutionContext,
    cursor: &Cursor,
    condition: &str,
    then: &[Step],
    otherwise: &[Step],
) -> Result<Outcome> {
    let scope = ctx.scope(&cursor.workflow).await;
    let value = expressions::evaluate(condition, &scope)?;

    let (kind, steps) = if expressions::truthy(&value) {
        (FrameKind::Then, then)
    } else {
        (FrameKind::Else, otherwise)
    };

    if steps.is_empty() {
        return Ok(Outcome::Continue {
            output: Value::Null,
        });
    }

    Ok(Outcome::Jump {
        frame: frame_name(&cursor.workflow, cursor.step, &kind),
        locals: branch_seed(ctx, cursor).await,
        items: None,
    })
}

/// Evaluate each case in order; the first truthy case wins. No match is a
/// no-op with a null output.
pub async fn exec_switch(
    ctx: &ExecutionContext,
    cursor: &Cursor,
    cases: &[SwitchCase],
) -> Result<Outcome> {
    let scope = ctx.scope(&cursor.workflow).await;

    for (index, case) in cases.iter().enumerate() {
        let value = expressions::evaluate(&case.case, &scope)?;
        if expressions::truthy(&value) {
            if case.then.is_empty() {
                return Ok(Outcome::Continue {
                    output: Value::Null,
                });
            }
            return Ok(Outcome::Jump {
                frame: frame_name(&cursor.workflow, cursor.step, &FrameKind::Case(index)),
                locals: branch_seed(ctx, cursor).await,
                items: None,
            });
        }
    }

    Ok(Outcome::Continue {
        output: Value::Null,
    })
}
