//! Generic chat-completion backend for OpenAI-compatible providers.

use serde_json::{Value, json};
use tracing::debug;

use super::{CompletionBackend, CompletionRequest, Error, ModelResponse, Result};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct GenericBackend {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl GenericBackend {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Override the API base URL, for proxies or mock servers.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body(request: &CompletionRequest) -> Value {
        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), json!(request.model));
        for (key, value) in &request.settings {
            body.insert(key.clone(), value.clone());
        }
        body.insert("messages".to_string(), Value::Array(request.messages.clone()));

        if request.tools.is_empty() {
            // Without tools, tool_choice must be omitted entirely.
            body.remove("tool_choice");
        } else {
            body.insert("tools".to_string(), Value::Array(request.tools.clone()));
            if let Some(choice) = &request.tool_choice {
                body.insert("tool_choice".to_string(), choice.clone());
            }
        }

        body.insert(
            "cache".to_string(),
            json!({"no-cache": request.no_cache}),
        );

        Value::Object(body)
    }
}

#[async_trait::async_trait]
impl CompletionBackend for GenericBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<ModelResponse> {
        let url = self.completions_url();
        let body = Self::build_body(&request);

        debug!(url = %url, model = %request.model, "sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
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

        serde_json::from_str(&text).map_err(|e| Error::InvalidResponse {
            message: format!("{e}: {text}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tools: Vec<Value>, tool_choice: Option<Value>) -> CompletionRequest {
        let mut settings = serde_json::Map::new();
        settings.insert("temperature".to_string(), json!(0.5));
        CompletionRequest {
            model: "gpt-4o".to_string(),
            messages: vec![json!({"role": "user", "content": "hi"})],
            tools,
            tool_choice,
            settings,
            no_cache: false,
        }
    }

    #[test]
    fn body_passes_tools_through() {
        let tools = vec![json!({"type": "function", "function": {"name": "f"}})];
        let body = GenericBackend::build_body(&request(tools, Some(json!("auto"))));
        assert_eq!(body["tools"].as_array().unwrap().len(), 1);
        assert_eq!(body["tool_choice"], json!("auto"));
        assert_eq!(body["temperature"], json!(0.5));
    }

    #[test]
    fn body_omits_tool_choice_without_tools() {
        let body = GenericBackend::build_body(&request(vec![], Some(json!("auto"))));
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn body_carries_cache_flag() {
        let mut req = request(vec![], None);
        req.no_cache = true;
        let body = GenericBackend::build_body(&req);
        assert_eq!(body["cache"]["no-cache"], json!(true));
    }
}
