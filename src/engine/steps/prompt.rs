//! The `prompt` step executor: render messages, choose a backend,
//! dispatch, normalize, and re-key tool calls back to their true kinds.

use serde_json::{Value, json};

use crate::backends::{CompletionRequest, ModelResponse};
use crate::context::ExecutionContext;
use crate::definition::{PromptPayload, PromptStep};
use crate::expressions;
use crate::tools::{NATIVE_TOOL_KINDS, Tool, format_tools};
use crate::transition::Cursor;

use super::super::{Error, Result, TaskEngine};
use super::Outcome;

/// A prompt string with this prefix is evaluated as an expression whose
/// value becomes the prompt.
pub const EVAL_PROMPT_PREFIX: &str = "$_ ";

fn invalid_prompt() -> Error {
    Error::InvalidPromptExpression {
        message: "expected a string or a list of messages".to_string(),
    }
}

fn build_messages(
    step: &PromptStep,
    scope: &serde_json::Map<String, Value>,
) -> Result<Vec<Value>> {
    match &step.prompt {
        PromptPayload::Text(text) => {
            if let Some(expr) = text.strip_prefix(EVAL_PROMPT_PREFIX) {
                match expressions::evaluate(expr.trim(), scope)? {
                    Value::String(content) => {
                        Ok(vec![json!({"role": "user", "content": content})])
                    }
                    Value::Array(items) => {
                        for item in &items {
                            let ok = item.get("role").and_then(Value::as_str).is_some()
                                && item.get("content").and_then(Value::as_str).is_some();
                            if !ok {
                                return Err(invalid_prompt());
                            }
                        }
                        Ok(items)
                    }
                    _ => Err(invalid_prompt()),
                }
            } else {
                let content = expressions::render(text, scope)?;
                Ok(vec![json!({"role": "user", "content": content})])
            }
        }
        PromptPayload::Messages(messages) => {
            let mut rendered = Vec::with_capacity(messages.len());
            for message in messages {
                let content = expressions::render(&message.content, scope)?;
                rendered.push(json!({"role": message.role, "content": content}));
            }
            Ok(rendered)
        }
    }
}

fn is_native_descriptor(descriptor: &Value) -> bool {
    descriptor
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|kind| NATIVE_TOOL_KINDS.contains(&kind))
}

/// Rewrite each tool call to its original kind. Calls to `function` tools
/// stay as-is; any other kind becomes `{type: kind, kind: {name, arguments}}`.
fn rekey_tool_calls(
    response: &mut Value,
    mapping: &std::collections::HashMap<String, Tool>,
) -> Result<()> {
    let Some(choices) = response.get_mut("choices").and_then(Value::as_array_mut) else {
        return Ok(());
    };

    for choice in choices {
        if choice.get("finish_reason").and_then(Value::as_str) != Some("tool_calls") {
            continue;
        }
        let Some(calls) = choice
            .get_mut("message")
            .and_then(|m| m.get_mut("tool_calls"))
            .and_then(Value::as_array_mut)
        else {
            continue;
        };

        for call in calls {
            let name = call
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            let original = mapping.get(&name).ok_or_else(|| Error::UnknownTool {
                name: name.clone(),
            })?;

            if original.kind() == "function" {
                continue;
            }

            let arguments = call
                .get("function")
                .and_then(|f| f.get("arguments"))
                .cloned()
                .unwrap_or(Value::Null);
            let id = call.get("id").cloned();

            let mut rewritten = serde_json::Map::new();
            if let Some(id) = id {
                rewritten.insert("id".to_string(), id);
            }
            rewritten.insert("type".to_string(), json!(original.kind()));
            rewritten.insert(
                original.kind().to_string(),
                json!({"name": name, "arguments": arguments}),
            );
            *call = Value::Object(rewritten);
        }
    }

    Ok(())
}

fn first_finish_reason(response: &ModelResponse) -> &str {
    response
        .choices
        .first()
        .map(|c| c.finish_reason.as_str())
        .unwrap_or_default()
}

async fn dispatch(
    engine: &TaskEngine,
    ctx: &ExecutionContext,
    model: &str,
    messages: &[Value],
    formatted: &[Value],
    tool_choice: Option<Value>,
    settings: &serde_json::Map<String, Value>,
    no_cache: bool,
    use_native: bool,
) -> Result<ModelResponse> {
    let request = if use_native {
        // The native protocol owns its tool kinds; everything else is
        // dropped and messages are reduced to bare role/content pairs.
        let native_tools: Vec<Value> = formatted
            .iter()
            .filter(|t| is_native_descriptor(t))
            .cloned()
            .collect();
        let native_messages: Vec<Value> = messages
            .iter()
            .map(|m| json!({"role": m["role"], "content": m["content"]}))
            .collect();
        CompletionRequest {
            model: model.to_string(),
            messages: native_messages,
            tools: native_tools,
            tool_choice: None,
            settings: serde_json::Map::new(),
            no_cache,
        }
    } else {
        CompletionRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            tools: formatted.to_vec(),
            tool_choice,
            settings: settings.clone(),
            no_cache,
        }
    };

    let backend = if use_native {
        engine.native_backend()
    } else {
        engine.generic_backend()
    };

    engine
        .with_retry(ctx, "prompt", || {
            let request = request.clone();
            let backend = backend.clone();
            async move { backend.complete(request).await.map_err(Error::from) }
        })
        .await
}

fn unwrap_response(response: Value) -> Result<Outcome> {
    let count = response
        .get("choices")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    if count != 1 {
        return Err(Error::UnwrapMultipleChoices { count });
    }
    let choice = &response["choices"][0];
    if choice.get("finish_reason").and_then(Value::as_str) == Some("tool_calls") {
        return Err(Error::UnwrapToolCalls);
    }
    Ok(Outcome::Continue {
        output: choice["message"]["content"].clone(),
    })
}

pub async fn exec_prompt(
    engine: &TaskEngine,
    ctx: &ExecutionContext,
    cursor: &Cursor,
    step: &PromptStep,
) -> Result<Outcome> {
    let scope = ctx.scope(&cursor.workflow).await;
    let mut messages = build_messages(step, &scope)?;

    let (formatted, mapping) = format_tools(&ctx.tools, engine.reflector())?;

    // Agent defaults overlaid by step-level settings.
    let mut settings = ctx.agent.default_settings.clone();
    for (key, value) in &step.settings {
        settings.insert(key.clone(), value.clone());
    }
    let model = settings
        .remove("model")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| ctx.agent.model.clone());
    let tool_choice = settings.remove("tool_choice");
    let no_cache = engine.config().debug || step.disable_cache;

    let use_native = model.to_lowercase().starts_with("claude-3.5")
        && formatted.iter().any(is_native_descriptor);

    let mut depth = 0u32;
    loop {
        let response = dispatch(
            engine,
            ctx,
            &model,
            &messages,
            &formatted,
            tool_choice.clone(),
            &settings,
            no_cache,
            use_native,
        )
        .await?;

        let has_tool_calls = first_finish_reason(&response) == "tool_calls";

        if !(step.auto_run_tools && has_tool_calls) {
            let mut value = serde_json::to_value(&response)?;
            rekey_tool_calls(&mut value, &mapping)?;
            if step.unwrap {
                return unwrap_response(value);
            }
            return Ok(Outcome::Continue { output: value });
        }

        depth += 1;
        if depth > engine.config().engine.tool_loop_depth {
            return Err(Error::ToolLoopDepthExceeded {
                depth: engine.config().engine.tool_loop_depth,
            });
        }

        // Run each call through the dispatcher and feed the results back.
        let first = response
            .choices
            .first()
            .ok_or_else(|| Error::StepExecution {
                message: "backend returned no choices".to_string(),
            })?;
        let calls = first.message.tool_calls.clone().unwrap_or_default();

        messages.push(json!({
            "role": "assistant",
            "content": first.message.content,
            "tool_calls": calls,
        }));

        for call in &calls {
            let name = call
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let tool = mapping
                .get(&name)
                .cloned()
                .ok_or_else(|| Error::UnknownTool { name: name.clone() })?;

            let raw_arguments = call
                .get("function")
                .and_then(|f| f.get("arguments"))
                .cloned()
                .unwrap_or(Value::Null);
            let arguments = match raw_arguments {
                Value::String(s) => {
                    serde_json::from_str(&s).unwrap_or(Value::String(s))
                }
                other => other,
            };

            let result = engine
                .with_retry(ctx, &format!("tool:{name}"), || {
                    let tool = tool.clone();
                    let arguments = arguments.clone();
                    async move {
                        engine
                            .dispatcher()
                            .invoke(&tool, &arguments)
                            .await
                            .map_err(Error::from)
                    }
                })
                .await?;

            messages.push(json!({
                "role": "tool",
                "tool_call_id": call.get("id"),
                "name": name,
                "content": result.to_string(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{FunctionDef, IntegrationDef};
    use std::collections::HashMap;

    fn tool(name: &str, integration: bool) -> Tool {
        Tool {
            name: name.to_string(),
            description: None,
            function: (!integration).then(|| FunctionDef {
                description: None,
                parameters: None,
            }),
            system: None,
            integration: integration.then(|| IntegrationDef {
                provider: "brave".to_string(),
                method: None,
                setup: None,
                arguments: None,
            }),
            api_call: None,
            computer_20241022: None,
            bash_20241022: None,
            text_editor_20241022: None,
        }
    }

    fn tool_call_response(name: &str) -> Value {
        json!({
            "id": "resp_1",
            "model": "gpt-4o",
            "created": 0,
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": name, "arguments": "{\"query\": \"rust\"}"},
                    }],
                },
                "finish_reason": "tool_calls",
            }],
        })
    }

    #[test]
    fn integration_calls_are_rekeyed() {
        let mut mapping = HashMap::new();
        mapping.insert("search".to_string(), tool("search", true));

        let mut response = tool_call_response("search");
        rekey_tool_calls(&mut response, &mapping).unwrap();

        let call = &response["choices"][0]["message"]["tool_calls"][0];
        assert_eq!(call["type"], "integration");
        assert_eq!(call["integration"]["name"], "search");
        assert!(call.get("function").is_none());
    }

    #[test]
    fn function_calls_stay_function_shaped() {
        let mut mapping = HashMap::new();
        mapping.insert("lookup".to_string(), tool("lookup", false));

        let mut response = tool_call_response("lookup");
        rekey_tool_calls(&mut response, &mapping).unwrap();

        let call = &response["choices"][0]["message"]["tool_calls"][0];
        assert_eq!(call["type"], "function");
        assert_eq!(call["function"]["name"], "lookup");
    }

    #[test]
    fn unknown_tool_name_is_rejected() {
        let mut response = tool_call_response("ghost");
        let err = rekey_tool_calls(&mut response, &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::UnknownTool { .. }));
    }

    #[test]
    fn unwrap_rejects_tool_calls() {
        let response = tool_call_response("x");
        assert!(matches!(
            unwrap_response(response),
            Err(Error::UnwrapToolCalls)
        ));
    }

    #[test]
    fn unwrap_returns_single_choice_content() {
        let response = json!({
            "id": "r", "model": "m", "created": 0,
            "choices": [{
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop",
            }],
        });
        match unwrap_response(response).unwrap() {
            Outcome::Continue { output } => assert_eq!(output, json!("hello")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn eval_prefix_produces_user_message() {
        let step = PromptStep {
            prompt: PromptPayload::Text("$_ 'hi ' + input.name".to_string()),
            unwrap: false,
            auto_run_tools: false,
            disable_cache: false,
            settings: serde_json::Map::new(),
        };
        let scope = json!({"input": {"name": "ada"}});
        let messages = build_messages(&step, scope.as_object().unwrap()).unwrap();
        assert_eq!(messages, vec![json!({"role": "user", "content": "hi ada"})]);
    }

    #[test]
    fn eval_prefix_rejects_non_message_values() {
        let step = PromptStep {
            prompt: PromptPayload::Text("$_ 42".to_string()),
            unwrap: false,
            auto_run_tools: false,
            disable_cache: false,
            settings: serde_json::Map::new(),
        };
        let err = build_messages(&step, &serde_json::Map::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidPromptExpression { .. }));
    }
}
