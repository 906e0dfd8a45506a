//! Scratch-store, evaluation, logging, and workflow-control steps.

use indexmap::IndexMap;
use serde_json::Value;
use tracing::info;

use crate::context::ExecutionContext;
use crate::expressions;
use crate::transition::Cursor;

use super::super::{Error, Result};
use super::Outcome;

/// Evaluate each binding in declared order; the output is the new sub-map.
pub async fn exec_evaluate(
    ctx: &ExecutionContext,
    cursor: &Cursor,
    bindings: &IndexMap<String, String>,
) -> Result<Outcome> {
    let scope = ctx.scope(&cursor.workflow).await;
    let mut output = serde_json::Map::new();
    for (name, expr) in bindings {
        output.insert(name.clone(), expressions::evaluate(expr, &scope)?);
    }
    Ok(Outcome::Continue {
        output: Value::Object(output),
    })
}

/// Like `evaluate`, but the bindings are also written to the scratch store.
pub async fn exec_set(
    ctx: &ExecutionContext,
    cursor: &Cursor,
    bindings: &IndexMap<String, String>,
) -> Result<Outcome> {
    let scope = ctx.scope(&cursor.workflow).await;
    let mut output = serde_json::Map::new();
    for (name, expr) in bindings {
        output.insert(name.clone(), expressions::evaluate(expr, &scope)?);
    }
    for (name, value) in &output {
        ctx.set_state(name, value.clone()).await;
    }
    Ok(Outcome::Continue {
        output: Value::Object(output),
    })
}

pub async fn exec_get(ctx: &ExecutionContext, key: &str) -> Result<Outcome> {
    let value = ctx.get_state(key).await.ok_or_else(|| Error::KeyMissing {
        key: key.to_string(),
    })?;
    Ok(Outcome::Continue { output: value })
}

/// Render the template and emit it to the observer; the output is the
/// rendered line.
pub async fn exec_log(
    ctx: &ExecutionContext,
    cursor: &Cursor,
    template: &str,
) -> Result<Outcome> {
    let scope = ctx.scope(&cursor.workflow).await;
    let rendered = expressions::render(template, &scope)?;
    info!(target: "rook::task", execution_id = %ctx.execution_id, "{rendered}");
    Ok(Outcome::Continue {
        output: Value::String(rendered),
    })
}

pub async fn exec_return(
    ctx: &ExecutionContext,
    cursor: &Cursor,
    bindings: &IndexMap<String, String>,
) -> Result<Outcome> {
    let scope = ctx.scope(&cursor.workflow).await;
    let mut value = serde_json::Map::new();
    for (name, expr) in bindings {
        value.insert(name.clone(), expressions::evaluate(expr, &scope)?);
    }
    Ok(Outcome::Return {
        value: Value::Object(value),
    })
}

/// Resolve the sibling workflow and evaluate its arguments. An empty
/// target short-circuits to a null output.
pub async fn exec_yield(
    ctx: &ExecutionContext,
    cursor: &Cursor,
    workflow: &str,
    arguments: &IndexMap<String, String>,
) -> Result<Outcome> {
    let steps = ctx
        .task
        .workflow(workflow)
        .ok_or_else(|| Error::UnknownWorkflow {
            name: workflow.to_string(),
        })?;

    if steps.is_empty() {
        return Ok(Outcome::Continue {
            output: Value::Null,
        });
    }

    let scope = ctx.scope(&cursor.workflow).await;
    let mut args = serde_json::Map::new();
    for (name, expr) in arguments {
        args.insert(name.clone(), expressions::evaluate(expr, &scope)?);
    }

    Ok(Outcome::Call {
        workflow: workflow.to_string(),
        arguments: Value::Object(args),
    })
}
