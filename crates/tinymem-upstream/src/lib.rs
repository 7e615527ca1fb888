#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tinymem-upstream** – Client for the configured upstream chat model.
//!
//! The upstream speaks the OpenAI chat-completion shape. Two surfaces are
//! exposed: a typed [`ChatBackend`] used by the advisory components (CoVe,
//! shadow audit, repair loop), and a raw [`HttpUpstream::forward`] used by
//! the proxy to pass an enriched request through unchanged, streaming
//! included. Every call carries the configured timeout; failures map to
//! [`TinyMemError::UpstreamUnreachable`] and never panic.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tinymem_types::{Result, TinyMemError};

/// Connection settings for the upstream endpoint.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL, e.g. `http://127.0.0.1:11434`. The chat path is appended.
    pub base_url: String,
    /// Model name placed in requests built by the typed surface.
    pub model: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// One chat message in the OpenAI shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user`, or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// A system-role message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// A user-role message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Request body for a non-streaming completion.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Model name.
    pub model: String,
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,
    /// Always false on the typed surface; the proxy streams via `forward`.
    pub stream: bool,
    /// Sampling temperature, when the caller wants one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Token usage reported by the upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    #[serde(default)]
    pub prompt_tokens: i64,
    /// Tokens in the completion.
    #[serde(default)]
    pub completion_tokens: i64,
    /// Total tokens.
    #[serde(default)]
    pub total_tokens: i64,
}

/// A completed (non-streaming) chat response.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    /// Completion choices; the first is the answer.
    pub choices: Vec<ChatChoice>,
    /// Usage accounting, when reported.
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// One completion choice.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    /// The assistant message.
    pub message: ChatMessage,
}

impl ChatResponse {
    /// Text of the first choice, if any.
    pub fn text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// The seam the advisory components depend on, so tests can substitute a
/// scripted backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// One-shot completion: a system framing plus a user payload, answer
    /// text back.
    async fn complete_text(&self, system: &str, user: &str) -> Result<String>;
}

/// HTTP implementation over reqwest.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl HttpUpstream {
    /// Build a client with the configured timeout baked in.
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TinyMemError::UpstreamUnreachable(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// The full chat-completions URL.
    pub fn chat_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    /// The configured model name.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Typed non-streaming completion.
    pub async fn complete(&self, messages: Vec<ChatMessage>) -> Result<ChatResponse> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages,
            stream: false,
            temperature: None,
        };
        let response = self
            .client
            .post(self.chat_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| TinyMemError::UpstreamUnreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TinyMemError::UpstreamUnreachable(format!(
                "upstream returned {}",
                response.status()
            )));
        }
        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| TinyMemError::UpstreamUnreachable(format!("bad response body: {e}")))
    }

    /// Forward an already-built request body verbatim and hand back the raw
    /// response, streaming body and all. The proxy owns interpretation.
    pub async fn forward(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        debug!(url = %self.chat_url(), "forwarding chat request upstream");
        let response = self
            .client
            .post(self.chat_url())
            .json(body)
            .send()
            .await
            .map_err(|e| TinyMemError::UpstreamUnreachable(e.to_string()))?;
        Ok(response)
    }
}

#[async_trait]
impl ChatBackend for HttpUpstream {
    async fn complete_text(&self, system: &str, user: &str) -> Result<String> {
        let response = self
            .complete(vec![ChatMessage::system(system), ChatMessage::user(user)])
            .await?;
        response
            .text()
            .map(str::to_string)
            .ok_or_else(|| TinyMemError::UpstreamUnreachable("empty choice list".to_string()))
    }
}
