//! The tool invocation activity.
//!
//! The engine never interprets tool bodies; a handler registered per tool
//! kind is responsible for integration routing, API calls, and system
//! handlers. One handler ships built in: an HTTP executor for `api_call`
//! tools. Everything else is supplied by the embedding application.

use async_trait::async_trait;
use serde_json::Value;
use snafu::prelude::*;
use std::collections::HashMap;
use tracing::debug;

use crate::tools::Tool;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("No handler registered for tool kind '{kind}'"))]
    NoHandler { kind: String },

    #[snafu(display("Tool '{name}' failed: {message}"))]
    ToolFailure { name: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, tool: &Tool, arguments: &Value) -> Result<Value>;
}

/// Routes a tool invocation to the handler registered for its kind.
pub struct ToolDispatcher {
    handlers: HashMap<String, Box<dyn ToolHandler>>,
}

impl Default for ToolDispatcher {
    fn default() -> Self {
        let mut dispatcher = Self {
            handlers: HashMap::new(),
        };
        dispatcher.register("api_call", Box::new(ApiCallHandler::new()));
        dispatcher
    }
}

impl ToolDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, handler: Box<dyn ToolHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    pub async fn invoke(&self, tool: &Tool, arguments: &Value) -> Result<Value> {
        let kind = tool.kind();
        debug!(tool = %tool.name, kind, "invoking tool");
        let handler = self.handlers.get(kind).ok_or_else(|| Error::NoHandler {
            kind: kind.to_string(),
        })?;
        handler.invoke(tool, arguments).await
    }
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Built-in handler for `api_call` tools: issues the declared HTTP request
/// with the evaluated arguments as query (GET) or JSON body (otherwise).
pub struct ApiCallHandler {
    client: reqwest::Client,
}

impl ApiCallHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ApiCallHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for ApiCallHandler {
    async fn invoke(&self, tool: &Tool, arguments: &Value) -> Result<Value> {
        let api_call = tool.api_call.as_ref().ok_or_else(|| Error::ToolFailure {
            name: tool.name.clone(),
            message: "api_call variant not populated".to_string(),
        })?;

        let method = api_call.method.to_lowercase();
        let mut request = match method.as_str() {
            "post" => self.client.post(&api_call.url),
            "put" => self.client.put(&api_call.url),
            "delete" => self.client.delete(&api_call.url),
            "patch" => self.client.patch(&api_call.url),
            _ => self.client.get(&api_call.url),
        };

        if let Some(headers) = &api_call.headers {
            for (key, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(key, v);
                }
            }
        }

        request = if method == "get" {
            let pairs: Vec<(String, String)> = arguments
                .as_object()
                .map(|obj| {
                    obj.iter()
                        .map(|(k, v)| {
                            let rendered = match v {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            (k.clone(), rendered)
                        })
                        .collect()
                })
                .unwrap_or_default();
            request.query(&pairs)
        } else {
            request.json(arguments)
        };

        let response = request.send().await.map_err(|e| Error::ToolFailure {
            name: tool.name.clone(),
            message: e.to_string(),
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| Error::ToolFailure {
            name: tool.name.clone(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(Error::ToolFailure {
                name: tool.name.clone(),
                message: format!("HTTP {} from {}: {}", status.as_u16(), api_call.url, text),
            });
        }

        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}
