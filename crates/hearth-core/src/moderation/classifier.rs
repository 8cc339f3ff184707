//! Remote safety classifier client.
//!
//! The classifier is an OpenAI-compatible chat-completions endpoint (OpenRouter by default).
//! It is treated as an opaque, unreliable dependency: one request per call, no retries here,
//! and the caller bounds the call with its own timeout.

use crate::config::ModerationConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// What the moderation gateway sends for one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierRequest {
    /// Operation kind, e.g. `tone_check`. Used for headers and logs only.
    pub operation: String,
    pub system: String,
    /// Already-redacted user content.
    pub user: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierReply {
    /// Free text; expected to contain exactly one JSON object.
    pub content: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classifier request failed: {0}")]
    Transport(String),

    #[error("classifier returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("classifier response could not be decoded: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ClassifierError {
    fn from(err: reqwest::Error) -> Self {
        ClassifierError::Transport(err.to_string())
    }
}

/// Seam between the moderation gateway and the remote model.
#[async_trait::async_trait]
pub trait ClassifierClient: Send + Sync {
    /// Model identifier, for accounting.
    fn model(&self) -> &str;

    async fn complete(&self, request: &ClassifierRequest) -> Result<ClassifierReply, ClassifierError>;
}

// OpenAI-compatible request/response for OpenRouter
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions classifier over HTTP.
pub struct OpenRouterClassifier {
    api_base: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenRouterClassifier {
    pub fn new(api_key: impl Into<String>) -> Self {
        let defaults = ModerationConfig::default();
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_base: defaults.api_base,
            api_key: api_key.into().trim().to_string(),
            model: defaults.model,
            client,
        }
    }

    /// Build from config. Returns `None` if no API key is configured.
    pub fn from_config(cfg: &ModerationConfig) -> Option<Self> {
        let key = cfg.resolved_api_key()?;
        Some(
            Self::new(key)
                .with_api_base(&cfg.api_base)
                .with_model(&cfg.model),
        )
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait::async_trait]
impl ClassifierClient for OpenRouterClassifier {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ClassifierRequest) -> Result<ClassifierReply, ClassifierError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
        };

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Title", "Hearth-Moderation")
            .header("X-Hearth-Operation", request.operation.as_str())
            .json(&body)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ClassifierError::Status {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| ClassifierError::Decode(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ClassifierError::Decode("no choices in response".to_string()))?;

        Ok(ClassifierReply {
            content,
            usage: parsed.usage,
        })
    }
}
