//! LLM backends behind a uniform completion interface.
//!
//! Two variants: a generic chat-completion backend for OpenAI-style
//! providers, and a native-tools backend for Claude models carrying
//! computer-use tools. Both normalize to the same response shape so the
//! prompt step executor is backend-agnostic.

mod generic;
mod native;

pub use generic::GenericBackend;
pub use native::NativeBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("HTTP error: {message}"))]
    Http { message: String },

    #[snafu(display("Backend returned {status}: {message}"))]
    Api { status: u16, message: String },

    #[snafu(display("Invalid backend response: {message}"))]
    InvalidResponse { message: String },

    #[snafu(display("Native response carried {count} text blocks, expected at most one"))]
    MultipleTextBlocks { count: usize },

    #[snafu(display("Native response stopped without a text block"))]
    MissingTextBlock,
}

pub type Result<T> = std::result::Result<T, Error>;

/// A normalized completion request. `messages` and `tools` are already in
/// the provider-facing shape produced by the tool formatter.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub tools: Vec<Value>,
    pub tool_choice: Option<Value>,
    /// Agent defaults overlaid by step settings, passed through verbatim.
    pub settings: serde_json::Map<String, Value>,
    /// Opt-out flag forwarded to the backend; caching is its concern.
    pub no_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
    pub finish_reason: String,
}

/// The uniform response shape both backends normalize to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub id: String,
    pub model: String,
    pub created: i64,
    pub choices: Vec<Choice>,
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<ModelResponse>;
}
