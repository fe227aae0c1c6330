//! Inbound answer request model.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

/// Body of `POST /api/v1/answer-sse`.
#[derive(Debug, Clone, Deserialize)]
pub struct AnswerRequest {
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub language: String,
    /// Base64-encoded question audio.
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub config_id: String,
    #[serde(default)]
    pub chat_history: Vec<ChatTurn>,
    /// Presence (even empty) is a control signal: skip validation.
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
    #[serde(default)]
    pub transcript_confidence: Option<f32>,
    #[serde(default)]
    pub generate_answer: Option<bool>,
}

impl AnswerRequest {
    /// Field-level validation performed by the request adapter.
    pub fn validate(&self) -> Result<()> {
        if self.transcript.trim().is_empty() {
            return Err(CoreError::BadRequest("transcript is required".into()));
        }
        if self.org_id.trim().is_empty() {
            return Err(CoreError::BadRequest("org_id is required".into()));
        }
        if self.config_id.trim().is_empty() {
            return Err(CoreError::BadRequest("config_id is required".into()));
        }
        if self.language.trim().is_empty() {
            return Err(CoreError::BadRequest("language is required".into()));
        }
        if self.chat_history.iter().any(|turn| turn.content.is_empty()) {
            return Err(CoreError::BadRequest(
                "chat_history entries must carry content".into(),
            ));
        }
        Ok(())
    }
}
