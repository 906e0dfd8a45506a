//! Native-tools backend: the Anthropic Messages API with computer-use
//! tools, translated into the uniform response shape.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{
    Choice, CompletionBackend, CompletionRequest, Error, ModelResponse, ResponseMessage, Result,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const COMPUTER_USE_BETA_FLAG: &str = "computer-use-2024-10-22";
const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: String,
    model: String,
    stop_reason: Option<String>,
    content: Vec<ContentBlock>,
}

pub struct NativeBackend {
    api_key: String,
    base_url: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl NativeBackend {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            client: reqwest::Client::new(),
        }
    }

    /// Override the API base URL, for proxies or mock servers.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    #[must_use]
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    /// Translate a Messages API response into the uniform shape: tool_use
    /// blocks become `tool_calls`, and the single text block (if any)
    /// becomes the message content.
    fn normalize(response: MessagesResponse) -> Result<ModelResponse> {
        let text_blocks: Vec<&String> = response
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                _ => None,
            })
            .collect();

        if text_blocks.len() > 1 {
            return Err(Error::MultipleTextBlocks {
                count: text_blocks.len(),
            });
        }

        let choice = if response.stop_reason.as_deref() == Some("tool_use") {
            let tool_calls: Vec<Value> = response
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { id, name, input } => Some(json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": input},
                    })),
                    _ => None,
                })
                .collect();

            Choice {
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: text_blocks.first().map(|t| (*t).clone()),
                    tool_calls: Some(tool_calls),
                },
                finish_reason: "tool_calls".to_string(),
            }
        } else {
            let text = text_blocks.first().ok_or(Error::MissingTextBlock)?;
            Choice {
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: Some((*text).clone()),
                    tool_calls: None,
                },
                finish_reason: "stop".to_string(),
            }
        };

        Ok(ModelResponse {
            id: response.id,
            model: response.model,
            created: Utc::now().timestamp(),
            choices: vec![choice],
        })
    }
}

#[async_trait::async_trait]
impl CompletionBackend for NativeBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<ModelResponse> {
        let url = self.messages_url();
        let body = json!({
            "model": request.model,
            "max_tokens": self.max_tokens,
            "messages": request.messages,
            "tools": request.tools,
        });

        debug!(url = %url, model = %request.model, "sending native-tools request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", COMPUTER_USE_BETA_FLAG)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http {
                message: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| Error::Http {
            message: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let parsed: MessagesResponse =
            serde_json::from_str(&text).map_err(|e| Error::InvalidResponse {
                message: format!("{e}: {text}"),
            })?;

        Self::normalize(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(stop_reason: &str, content: Value) -> MessagesResponse {
        serde_json::from_value(json!({
            "id": "msg_1",
            "model": "claude-3-5-sonnet-20241022",
            "stop_reason": stop_reason,
            "content": content,
        }))
        .unwrap()
    }

    #[test]
    fn tool_use_collected_into_tool_calls() {
        let normalized = NativeBackend::normalize(response(
            "tool_use",
            json!([
                {"type": "text", "text": "thinking"},
                {"type": "tool_use", "id": "tu_1", "name": "computer", "input": {"action": "screenshot"}},
            ]),
        ))
        .unwrap();

        let choice = &normalized.choices[0];
        assert_eq!(choice.finish_reason, "tool_calls");
        assert_eq!(choice.message.content.as_deref(), Some("thinking"));
        let calls = choice.message.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["function"]["name"], "computer");
    }

    #[test]
    fn stop_requires_exactly_one_text_block() {
        let normalized =
            NativeBackend::normalize(response("end_turn", json!([{"type": "text", "text": "hi"}])))
                .unwrap();
        assert_eq!(normalized.choices[0].finish_reason, "stop");
        assert_eq!(normalized.choices[0].message.content.as_deref(), Some("hi"));

        let missing = NativeBackend::normalize(response("end_turn", json!([])));
        assert!(matches!(missing, Err(Error::MissingTextBlock)));
    }

    #[test]
    fn multiple_text_blocks_rejected() {
        let err = NativeBackend::normalize(response(
            "end_turn",
            json!([
                {"type": "text", "text": "a"},
                {"type": "text", "text": "b"},
            ]),
        ));
        assert!(matches!(err, Err(Error::MultipleTextBlocks { count: 2 })));
    }
}
