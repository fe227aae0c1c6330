//! Streaming answer generation against OpenAI-compatible chat endpoints.
//!
//! Models prefixed `groq/` route to the Groq endpoint, which accepts a single
//! system message, so system prompts are collapsed before dispatch. Both
//! providers stream `data:` lines terminated by `[DONE]`.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{CoreError, Result};

pub const GROQ_MODEL_PREFIX: &str = "groq/";
pub const DEFAULT_GENERATOR_MODEL: &str = "gpt-4.1-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.01;
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
    pub api_key: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Generator seam: a request becomes an async sequence of text fragments.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest)
        -> Result<BoxStream<'static, Result<String>>>;
}

pub struct OpenAiCompatibleGenerator {
    http: reqwest::Client,
    openai_base_url: String,
    groq_base_url: String,
}

impl OpenAiCompatibleGenerator {
    pub fn new(http: reqwest::Client, openai_base_url: String, groq_base_url: String) -> Self {
        Self {
            http,
            openai_base_url,
            groq_base_url,
        }
    }
}

#[async_trait]
impl AnswerGenerator for OpenAiCompatibleGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let (url, body) = if let Some(model) = request.model.strip_prefix(GROQ_MODEL_PREFIX) {
            info!(model, "Routing generation to Groq");
            let messages = collapse_system_prompts(&request.messages);
            (
                format!("{}/chat/completions", self.groq_base_url),
                serde_json::json!({
                    "model": model,
                    "messages": messages,
                    "temperature": request.temperature,
                    "max_completion_tokens": request.max_tokens,
                    "stream": true,
                }),
            )
        } else {
            (
                format!("{}/chat/completions", self.openai_base_url),
                serde_json::json!({
                    "model": request.model,
                    "messages": request.messages,
                    "temperature": request.temperature,
                    "max_tokens": request.max_tokens,
                    "stream": true,
                    "stream_options": { "include_usage": true },
                }),
            )
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&request.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::LlmFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::LlmFailed(format!("HTTP {status}: {text}")));
        }

        let mut bytes = response.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| CoreError::LlmFailed(e.to_string()))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim_end_matches('\r').to_string();
                    buffer.drain(..=newline);
                    match delta_from_sse_line(&line) {
                        Some(StreamDelta::Done) => return,
                        Some(StreamDelta::Content(content)) => yield content,
                        None => {}
                    }
                }
            }
            debug!("Generator stream ended without [DONE]");
        };
        Ok(stream.boxed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    Content(String),
    Done,
}

/// Decode one SSE line from a chat completions stream.
pub fn delta_from_sse_line(line: &str) -> Option<StreamDelta> {
    let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let data = data.trim();
    if data == "[DONE]" {
        return Some(StreamDelta::Done);
    }
    let value: Value = serde_json::from_str(data).ok()?;
    let content = value["choices"][0]["delta"]["content"].as_str()?;
    if content.is_empty() {
        return None;
    }
    Some(StreamDelta::Content(content.to_string()))
}

/// Fold every system message into one leading system message, keeping the
/// rest in order.
pub fn collapse_system_prompts(messages: &[PromptMessage]) -> Vec<PromptMessage> {
    let mut system_parts = Vec::new();
    let mut rest = Vec::new();
    for message in messages {
        match message.role {
            PromptRole::System => system_parts.push(message.content.clone()),
            _ => rest.push(message.clone()),
        }
    }
    let mut out = Vec::with_capacity(rest.len() + 1);
    if !system_parts.is_empty() {
        out.push(PromptMessage::system(system_parts.join("\n\n")));
    }
    out.extend(rest);
    out
}
