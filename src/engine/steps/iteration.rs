//! Sequential iteration: `foreach` and the inline (parallelism 1) form of
//! map-reduce. Higher parallelism fans out through child executions, see
//! the parallel module.

use serde_json::{Value, json};

use crate::context::ExecutionContext;
use crate::definition::{FrameKind, MapReduceStep, Step, frame_name};
use crate::expressions;
use crate::transition::Cursor;

use super::super::{Error, Result, TaskEngine};
use super::{Outcome, parallel};

fn require_array(value: Value, expr: &str) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(Error::StepExecution {
            message: format!("'{expr}' must evaluate to a sequence, got: {other}"),
        }),
    }
}

/// Entry bindings for one iteration: the element seeds `_`, plus `index`.
pub(crate) fn iteration_locals(element: &Value, index: usize) -> serde_json::Map<String, Value> {
    let mut locals = serde_json::Map::new();
    locals.insert("seed".to_string(), element.clone());
    locals.insert("index".to_string(), json!(index));
    locals
}

pub async fn exec_foreach(
    ctx: &ExecutionContext,
    cursor: &Cursor,
    collection: &str,
    body: &[Step],
) -> Result<Outcome> {
    let scope = ctx.scope(&cursor.workflow).await;
    let items = require_array(expressions::evaluate(collection, &scope)?, collection)?;

    if items.is_empty() || body.is_empty() {
        return Ok(Outcome::Continue { output: json!([]) });
    }

    let locals = iteration_locals(&items[0], 0);
    Ok(Outcome::Jump {
        frame: frame_name(&cursor.workflow, cursor.step, &FrameKind::Iter(0)),
        locals,
        items: Some(items),
    })
}

pub async fn exec_map(
    engine: &TaskEngine,
    ctx: &ExecutionContext,
    cursor: &Cursor,
    step: &MapReduceStep,
) -> Result<Outcome> {
    let scope = ctx.scope(&cursor.workflow).await;
    let items = require_array(expressions::evaluate(&step.over, &scope)?, &step.over)?;

    if items.is_empty() || step.map.is_empty() {
        let output = fold_reduce(
            step.reduce.as_deref(),
            step.initial.as_deref(),
            Vec::new(),
            &scope,
        )?;
        return Ok(Outcome::Continue { output });
    }

    let parallelism = step.parallelism.unwrap_or(1);
    if parallelism <= 1 {
        let locals = iteration_locals(&items[0], 0);
        return Ok(Outcome::Jump {
            frame: frame_name(&cursor.workflow, cursor.step, &FrameKind::MapIter(0)),
            locals,
            items: Some(items),
        });
    }

    // Fan out as child executions, bounded by the declared parallelism.
    let mapped = parallel::run_mapped_children(engine, ctx, cursor, step, &items, parallelism)
        .await?;
    let output = fold_reduce(
        step.reduce.as_deref(),
        step.initial.as_deref(),
        mapped,
        &scope,
    )?;
    Ok(Outcome::Continue { output })
}

/// Left fold of the mapped outputs. Without `reduce` the output is the
/// list itself. The accumulator starts from `initial` when declared,
/// otherwise from the first element (null for an empty sequence). Inside
/// the reduce expression the accumulator is `results` and the current
/// element is `_`.
pub(crate) fn fold_reduce(
    reduce: Option<&str>,
    initial: Option<&str>,
    mapped: Vec<Value>,
    scope: &serde_json::Map<String, Value>,
) -> Result<Value> {
    let Some(reduce_expr) = reduce else {
        return Ok(Value::Array(mapped));
    };

    let (mut acc, rest) = match initial {
        Some(initial_expr) => (
            expressions::evaluate(initial_expr, scope)?,
            mapped.as_slice(),
        ),
        None => match mapped.split_first() {
            Some((first, rest)) => (first.clone(), rest),
            None => (Value::Null, &[] as &[Value]),
        },
    };

    for item in rest {
        let mut fold_scope = scope.clone();
        fold_scope.insert("results".to_string(), acc);
        fold_scope.insert("_".to_string(), item.clone());
        acc = expressions::evaluate(reduce_expr, &fold_scope)?;
    }

    Ok(acc)
}
