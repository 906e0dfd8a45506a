//! Concurrent fan-out: `parallel` branches and map-reduce with
//! parallelism above one. Branches run as child executions with their own
//! transition logs so cancellation and retries compose with the engine's
//! policy.

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::definition::{MapReduceStep, Step};
use crate::transition::Cursor;

use super::super::{Error, Result, TaskEngine};
use super::{Outcome, iteration};

async fn cancel_children(engine: &TaskEngine, children: &[Uuid], reason: &str) {
    for child in children {
        if let Err(e) = engine.cancel(*child, Some(reason.to_string())).await {
            warn!(child = %child, error = %e, "failed to cancel child execution");
        }
    }
}

pub async fn exec_parallel(
    engine: &TaskEngine,
    ctx: &ExecutionContext,
    cursor: &Cursor,
    branches: &[Vec<Step>],
) -> Result<Outcome> {
    let scope = ctx.scope(&cursor.workflow).await;
    let input = scope.get("input").cloned().unwrap_or(Value::Null);

    let mut seed = serde_json::Map::new();
    if let Some(last) = scope.get("_") {
        seed.insert("seed".to_string(), last.clone());
    }

    let mut children = Vec::with_capacity(branches.len());
    for (index, branch) in branches.iter().enumerate() {
        let child = engine
            .spawn_child(
                ctx,
                &format!("{}-branch{index}", ctx.task.name),
                branch.clone(),
                input.clone(),
                seed.clone(),
            )
            .await?;
        children.push(child);
    }

    let results: Vec<Result<Value>> =
        futures::future::join_all(children.iter().map(|id| engine.run_child(*id))).await;

    let mut outputs = Vec::with_capacity(results.len());
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(output) => outputs.push(output),
            Err(e) => {
                // First branch error wins; siblings get a cancel signal.
                cancel_children(engine, &children, "sibling branch failed").await;
                return Ok(Outcome::Fail {
                    message: format!("parallel branch {index} failed: {e}"),
                });
            }
        }
    }

    Ok(Outcome::Continue {
        output: Value::Array(outputs),
    })
}

/// Map each element through a child execution, at most `parallelism` in
/// flight, outputs in element order.
pub async fn run_mapped_children(
    engine: &TaskEngine,
    ctx: &ExecutionContext,
    cursor: &Cursor,
    step: &MapReduceStep,
    items: &[Value],
    parallelism: usize,
) -> Result<Vec<Value>> {
    let scope = ctx.scope(&cursor.workflow).await;
    let input = scope.get("input").cloned().unwrap_or(Value::Null);

    let mut children = Vec::with_capacity(items.len());
    for (index, element) in items.iter().enumerate() {
        let child = engine
            .spawn_child(
                ctx,
                &format!("{}-map{index}", ctx.task.name),
                step.map.clone(),
                input.clone(),
                iteration::iteration_locals(element, index),
            )
            .await?;
        children.push(child);
    }

    let results: Vec<Result<Value>> = stream::iter(children.iter().map(|id| engine.run_child(*id)))
        .buffered(parallelism)
        .collect()
        .await;

    let mut outputs = Vec::with_capacity(results.len());
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(output) => outputs.push(output),
            Err(e) => {
                cancel_children(engine, &children, "sibling map element failed").await;
                return Err(Error::StepExecution {
                    message: format!("map element {index} failed: {e}"),
                });
            }
        }
    }

    Ok(outputs)
}
