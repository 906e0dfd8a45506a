/// Tests for the prompt step executor against mocked backends: rendering,
/// unwrap, tool-call re-keying, auto-run tools, and the native-tools path.
use serde_json::{Value, json};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rook::backends::{GenericBackend, NativeBackend};
use rook::config::RookConfig;
use rook::dispatch::{ToolDispatcher, ToolHandler};
use rook::engine::TaskEngine;
use rook::providers::store::MemoryStore;
use rook::tools::Tool;
use rook::transition::TransitionType;

mod common;
use common::{agent_yaml, task};

fn engine_with_generic(server: &MockServer) -> Arc<TaskEngine> {
    let backend = GenericBackend::new("test-key").base_url(server.uri());
    Arc::new(
        TaskEngine::new(Arc::new(MemoryStore::new()), RookConfig::default())
            .with_generic_backend(Arc::new(backend)),
    )
}

fn stop_response(content: &str) -> Value {
    json!({
        "id": "resp_1",
        "model": "gpt-4o",
        "created": 1730000000,
        "choices": [{
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop",
        }],
    })
}

fn tool_call_response(name: &str, arguments: &str) -> Value {
    json!({
        "id": "resp_2",
        "model": "gpt-4o",
        "created": 1730000000,
        "choices": [{
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": name, "arguments": arguments},
                }],
            },
            "finish_reason": "tool_calls",
        }],
    })
}

#[tokio::test]
async fn prompt_renders_template_and_returns_normalized_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(stop_response("pong")))
        .mount(&server)
        .await;

    let engine = engine_with_generic(&server);
    let t = task(
        r#"
name: pinger
main:
  - prompt:
      prompt: "say {{ input.word }}"
  - return:
      text: "_.choices[0].message.content"
"#,
    );

    let (execution_id, _) = engine
        .start(t, agent_yaml("name: bot"), json!({"word": "ping"}))
        .await
        .unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.ty, TransitionType::Finish);
    assert_eq!(terminal.output, json!({"text": "pong"}));
}

#[tokio::test]
async fn unwrap_returns_the_bare_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(stop_response("just text")))
        .mount(&server)
        .await;

    let engine = engine_with_generic(&server);
    let t = task(
        r#"
name: unwrapped
main:
  - prompt:
      prompt: "hello"
      unwrap: true
  - return:
      text: "_"
"#,
    );

    let (execution_id, _) = engine
        .start(t, agent_yaml("name: bot"), json!({}))
        .await
        .unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.output, json!({"text": "just text"}));
}

#[tokio::test]
async fn unwrap_of_a_tool_call_response_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(tool_call_response("search", "{}")),
        )
        .mount(&server)
        .await;

    let engine = engine_with_generic(&server);
    let t = task(
        r#"
name: badunwrap
main:
  - prompt:
      prompt: "go"
      unwrap: true
tools:
  - name: search
    integration:
      provider: brave
"#,
    );

    let (execution_id, _) = engine
        .start(t, agent_yaml("name: bot"), json!({}))
        .await
        .unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.ty, TransitionType::Error);
    assert!(terminal.output.as_str().unwrap().contains("unwrapped"));
}

#[tokio::test]
async fn integration_tool_call_is_rekeyed_in_the_output() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tool_call_response(
            "search",
            "{\"query\": \"rust workflows\"}",
        )))
        .mount(&server)
        .await;

    let engine = engine_with_generic(&server);
    let t = task(
        r#"
name: searcher
main:
  - prompt:
      prompt: "find stuff"
  - return:
      call: "_.choices[0].message.tool_calls[0]"
"#,
    );
    let agent = agent_yaml(
        r#"
name: bot
tools:
  - name: search
    integration:
      provider: brave
"#,
    );

    let (execution_id, _) = engine.start(t, agent, json!({})).await.unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.ty, TransitionType::Finish);

    let call = &terminal.output["call"];
    assert_eq!(call["type"], json!("integration"));
    assert_eq!(call["integration"]["name"], json!("search"));
    assert!(call.get("function").is_none());
}

#[tokio::test]
async fn unknown_tool_in_the_response_fails_the_step() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(tool_call_response("ghost", "{}")),
        )
        .mount(&server)
        .await;

    let engine = engine_with_generic(&server);
    let t = task(
        r#"
name: ghostly
main:
  - prompt:
      prompt: "go"
"#,
    );

    let (execution_id, _) = engine
        .start(t, agent_yaml("name: bot"), json!({}))
        .await
        .unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.ty, TransitionType::Error);
    assert!(terminal.output.as_str().unwrap().contains("ghost"));
}

struct AddingHandler;

#[async_trait::async_trait]
impl ToolHandler for AddingHandler {
    async fn invoke(
        &self,
        _tool: &Tool,
        arguments: &Value,
    ) -> rook::dispatch::Result<Value> {
        let a = arguments["a"].as_i64().unwrap_or(0);
        let b = arguments["b"].as_i64().unwrap_or(0);
        Ok(json!({"sum": a + b}))
    }
}

#[tokio::test]
async fn auto_run_tools_loops_until_a_plain_response() {
    let server = MockServer::start().await;
    // First call returns a tool call, the follow-up returns text.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tool_call_response(
            "adder",
            "{\"a\": 2, \"b\": 3}",
        )))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(stop_response("the sum is 5")))
        .mount(&server)
        .await;

    let mut dispatcher = ToolDispatcher::new();
    dispatcher.register("function", Box::new(AddingHandler));

    let backend = GenericBackend::new("test-key").base_url(server.uri());
    let engine = Arc::new(
        TaskEngine::new(Arc::new(MemoryStore::new()), RookConfig::default())
            .with_generic_backend(Arc::new(backend))
            .with_dispatcher(dispatcher),
    );

    let t = task(
        r#"
name: autorun
main:
  - prompt:
      prompt: "add 2 and 3"
      auto_run_tools: true
      unwrap: true
tools:
  - name: adder
    function:
      parameters:
        type: object
        properties:
          a: {type: number}
          b: {type: number}
"#,
    );

    let (execution_id, _) = engine
        .start(t, agent_yaml("name: bot"), json!({}))
        .await
        .unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.ty, TransitionType::Finish);
    assert_eq!(terminal.output, json!("the sum is 5"));

    // Two completion calls: the tool round plus the final answer.
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn auto_run_tools_depth_cap_is_enforced() {
    let server = MockServer::start().await;
    // Every response asks for another tool round.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tool_call_response(
            "adder",
            "{\"a\": 1, \"b\": 1}",
        )))
        .mount(&server)
        .await;

    let mut dispatcher = ToolDispatcher::new();
    dispatcher.register("function", Box::new(AddingHandler));

    let backend = GenericBackend::new("test-key").base_url(server.uri());
    let engine = Arc::new(
        TaskEngine::new(Arc::new(MemoryStore::new()), RookConfig::default())
            .with_generic_backend(Arc::new(backend))
            .with_dispatcher(dispatcher),
    );

    let t = task(
        r#"
name: endless
main:
  - prompt:
      prompt: "loop forever"
      auto_run_tools: true
tools:
  - name: adder
    function:
      parameters: {type: object}
"#,
    );

    let (execution_id, _) = engine
        .start(t, agent_yaml("name: bot"), json!({}))
        .await
        .unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.ty, TransitionType::Error);
    assert!(terminal.output.as_str().unwrap().contains("depth"));
}

#[tokio::test]
async fn native_tools_route_to_the_messages_api_and_rekey() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1",
            "model": "claude-3.5-sonnet",
            "stop_reason": "tool_use",
            "content": [
                {"type": "text", "text": "taking a screenshot"},
                {"type": "tool_use", "id": "tu_1", "name": "computer",
                 "input": {"action": "screenshot"}},
            ],
        })))
        .mount(&server)
        .await;

    let native = NativeBackend::new("test-key").base_url(server.uri());
    let engine = Arc::new(
        TaskEngine::new(Arc::new(MemoryStore::new()), RookConfig::default())
            .with_native_backend(Arc::new(native)),
    );

    let t = task(
        r#"
name: operator
main:
  - prompt:
      prompt: "take a screenshot"
  - return:
      call: "_.choices[0].message.tool_calls[0]"
      text: "_.choices[0].message.content"
"#,
    );
    let agent = agent_yaml(
        r#"
name: desktop
model: claude-3.5-sonnet
tools:
  - name: computer
    computer_20241022:
      display_width_px: 1024
      display_height_px: 768
"#,
    );

    let (execution_id, _) = engine.start(t, agent, json!({})).await.unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.ty, TransitionType::Finish);

    let call = &terminal.output["call"];
    assert_eq!(call["type"], json!("computer_20241022"));
    assert_eq!(call["computer_20241022"]["name"], json!("computer"));
    assert_eq!(terminal.output["text"], json!("taking a screenshot"));

    // The native path got only native tools and the beta flag.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    let beta = request.headers.get("anthropic-beta").unwrap();
    assert_eq!(beta.to_str().unwrap(), "computer-use-2024-10-22");
    let body: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["max_tokens"], json!(1024));
    assert_eq!(body["tools"][0]["type"], json!("computer_20241022"));
}
