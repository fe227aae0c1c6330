//! Transcript validation against the optional question audio.
//!
//! The provider corrects the transcript and extracts search keywords; when it
//! fails recoverably the flow continues with an identity validation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::request::{ChatRole, ChatTurn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub correction: String,
    pub keywords: Vec<String>,
}

impl ValidationOutcome {
    /// Fallback used when validation is skipped or the provider fails.
    pub fn identity(transcript: &str, keywords: Vec<String>) -> Self {
        Self {
            correction: transcript.to_string(),
            keywords,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationPrompts {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub prompts: ValidationPrompts,
    pub language: String,
    pub transcript: String,
    /// Raw audio bytes; text-only validation when absent.
    pub audio: Option<Vec<u8>>,
    pub chat_history: Vec<ChatTurn>,
    pub model: String,
    pub api_key: String,
}

/// Validator seam.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, request: &ValidationRequest) -> Result<ValidationOutcome>;
}

/// HTTP validator speaking the provider's `generateContent` shape.
pub struct HttpValidator {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpValidator {
    pub fn new(http: reqwest::Client, base_url: String, timeout: Duration) -> Self {
        Self {
            http,
            base_url,
            timeout,
        }
    }
}

#[async_trait]
impl Validator for HttpValidator {
    async fn validate(&self, request: &ValidationRequest) -> Result<ValidationOutcome> {
        let mut parts = Vec::new();
        if let Some(audio) = &request.audio {
            use base64::Engine;
            parts.push(serde_json::json!({
                "inlineData": {
                    "mimeType": "audio/wav",
                    "data": base64::engine::general_purpose::STANDARD.encode(audio),
                }
            }));
        }
        let mut user_text = String::new();
        for turn in &request.chat_history {
            let speaker = match turn.role {
                ChatRole::User => "User",
                ChatRole::Assistant => "Assistant",
            };
            user_text.push_str(&format!("{speaker}: {}\n", turn.content));
        }
        user_text.push_str(&request.prompts.user);
        parts.push(serde_json::json!({ "text": user_text }));

        let body = serde_json::json!({
            "contents": [{ "role": "user", "parts": parts }],
            "systemInstruction": { "parts": [{ "text": request.prompts.system }] },
            "generationConfig": {
                "temperature": 0.1,
                "responseMimeType": "application/json",
            },
        });

        let url = format!("{}/models/{}:generateContent", self.base_url, request.model);
        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &request.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::ValidatorFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::ValidatorFailed(format!("HTTP {status}: {text}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| CoreError::ValidatorFailed(e.to_string()))?;
        let answer_text = payload["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| CoreError::ValidatorFailed("Empty validator response".into()))?;
        debug!(response = answer_text, "Validator response text");
        parse_validator_payload(answer_text)
    }
}

/// Parse the validator's JSON text: either a flat `keywords` array or the
/// nested `searchTerms` shape, which is flattened into one keyword list.
pub fn parse_validator_payload(text: &str) -> Result<ValidationOutcome> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| CoreError::ValidatorFailed(format!("Malformed validator JSON: {e}")))?;
    let correction = value["correction"]
        .as_str()
        .ok_or_else(|| CoreError::ValidatorFailed("Validator response missing correction".into()))?
        .to_string();

    let mut keywords = Vec::new();
    if let Some(flat) = value["keywords"].as_array() {
        keywords.extend(flat.iter().filter_map(|v| v.as_str()).map(str::to_string));
    } else if let Some(terms) = value.get("searchTerms") {
        collect_query_keywords(&terms["translatedQuestion"], &mut keywords);
        if let Some(queries) = terms["searchQueries"].as_array() {
            for query in queries {
                collect_query_keywords(query, &mut keywords);
            }
        }
    }
    keywords.retain(|k| !k.trim().is_empty());
    keywords.dedup();
    Ok(ValidationOutcome {
        correction,
        keywords,
    })
}

fn collect_query_keywords(entry: &Value, out: &mut Vec<String>) {
    if let Some(query) = entry["query"].as_str() {
        if !query.trim().is_empty() {
            out.push(query.to_string());
        }
    }
    if let Some(words) = entry["keywords"].as_array() {
        out.extend(words.iter().filter_map(|v| v.as_str()).map(str::to_string));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_keywords_parse_directly() {
        let outcome = parse_validator_payload(
            r#"{"correction": "where is the lobby", "keywords": ["lobby", "directions"]}"#,
        )
        .unwrap();
        assert_eq!(outcome.correction, "where is the lobby");
        assert_eq!(outcome.keywords, vec!["lobby", "directions"]);
    }

    #[test]
    fn nested_search_terms_are_flattened() {
        let outcome = parse_validator_payload(
            r#"{
                "correction": "opening hours",
                "searchTerms": {
                    "translatedQuestion": { "query": "opening hours", "keywords": ["hours"] },
                    "searchQueries": [
                        { "query": "store schedule", "keywords": ["schedule"] }
                    ]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(
            outcome.keywords,
            vec!["opening hours", "hours", "store schedule", "schedule"]
        );
    }

    #[test]
    fn missing_correction_is_an_error() {
        let err = parse_validator_payload(r#"{"keywords": []}"#).unwrap_err();
        assert!(matches!(err, CoreError::ValidatorFailed(_)));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_validator_payload("not json").is_err());
    }
}
