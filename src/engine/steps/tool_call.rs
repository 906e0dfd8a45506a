//! The `tool_call` step: resolve the tool, evaluate its arguments, and
//! invoke it through the dispatcher as a retryable activity.

use indexmap::IndexMap;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::expressions;
use crate::transition::Cursor;

use super::super::{Error, Result, TaskEngine};
use super::Outcome;

pub async fn exec_tool_call(
    engine: &TaskEngine,
    ctx: &ExecutionContext,
    cursor: &Cursor,
    tool_name: &str,
    arguments: &IndexMap<String, Value>,
) -> Result<Outcome> {
    // Unknown tools fail before any dispatch or argument evaluation
    // touches the outside world.
    let tool = ctx
        .tools
        .iter()
        .find(|t| t.name == tool_name)
        .cloned()
        .ok_or_else(|| Error::UnknownTool {
            name: tool_name.to_string(),
        })?;

    let scope = ctx.scope(&cursor.workflow).await;
    let mut args = serde_json::Map::new();
    for (name, value) in arguments {
        args.insert(name.clone(), expressions::evaluate_value(value, &scope)?);
    }
    let args = Value::Object(args);

    let output = engine
        .with_retry(ctx, &format!("tool:{tool_name}"), || {
            let tool = tool.clone();
            let args = args.clone();
            async move {
                engine
                    .dispatcher()
                    .invoke(&tool, &args)
                    .await
                    .map_err(Error::from)
            }
        })
        .await?;

    Ok(Outcome::Continue { output })
}
