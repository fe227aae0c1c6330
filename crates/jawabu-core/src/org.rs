//! Organisation configuration: per-tenant localisations, provider keys and
//! TTS voice models.
//!
//! The hosted store (DynamoDB) is a collaborator behind [`ConfigStore`]; the
//! bundled implementation reads JSON documents from a local directory.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};

/// Per-language bundle of prompts, model choices and voice settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Localization {
    pub language: String,
    pub assistant_id: String,
    pub assistant_key: String,
    /// `groq/`-prefixed models route to Groq, everything else is
    /// OpenAI-compatible.
    #[serde(default)]
    pub generator_model: Option<String>,
    /// URL of the generator system prompt template.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub generator_format_text_prompt_url: Option<String>,
    #[serde(default)]
    pub validator_system_prompt_template_url: Option<String>,
    #[serde(default)]
    pub validator_transcript_prompt_template_url: Option<String>,
}

/// A single TTS voice configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsModel {
    pub language: String,
    pub name: String,
    #[serde(default)]
    pub pitch: Option<String>,
    #[serde(default)]
    pub phoneme_url: Option<String>,
    /// Whether the voice distinguishes letter case. Case-insensitive voices
    /// get lowercased cache keys; the flag is per-model so keying is stable.
    #[serde(default)]
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureTtsConfig {
    #[serde(default)]
    pub subscription_key: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Phoneme table shared by every voice.
    #[serde(default)]
    pub phoneme_url: Option<String>,
    pub models: Vec<TtsModel>,
}

fn default_region() -> String {
    "southeastasia".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    pub azure: AzureTtsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAiConfig {
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroqConfig {
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorConfig {
    pub api_key: String,
    #[serde(default = "default_validator_model")]
    pub model: String,
}

fn default_validator_model() -> String {
    "gemini-2.5-flash".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgConfig {
    pub km_id: String,
    pub display_name: String,
    pub default_primary_language: String,
    pub localization: Vec<Localization>,
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub groq: Option<GroqConfig>,
    #[serde(default)]
    pub validator: Option<ValidatorConfig>,
    #[serde(default)]
    pub tts: Option<TtsConfig>,
}

impl OrgConfig {
    /// Localisation for `language`, falling back to the default primary
    /// language. Every valid configuration resolves for at least one of the
    /// two.
    pub fn localization_for(&self, language: &str) -> Result<&Localization> {
        self.localization
            .iter()
            .find(|loc| loc.language == language)
            .or_else(|| {
                self.localization
                    .iter()
                    .find(|loc| loc.language == self.default_primary_language)
            })
            .ok_or_else(|| {
                CoreError::Config(format!(
                    "No localization for language {} or default {}",
                    language, self.default_primary_language
                ))
            })
    }

    /// Voice model for `language`, falling back to the voice of the default
    /// primary language.
    pub fn voice_for(&self, language: &str) -> Option<&TtsModel> {
        let azure = &self.tts.as_ref()?.azure;
        azure
            .models
            .iter()
            .find(|m| m.language.eq_ignore_ascii_case(language))
            .or_else(|| {
                debug!(language, "No TTS voice for language, using default");
                azure
                    .models
                    .iter()
                    .find(|m| m.language.eq_ignore_ascii_case(&self.default_primary_language))
            })
    }

    pub fn tts_subscription_key(&self) -> Option<&str> {
        self.tts
            .as_ref()?
            .azure
            .subscription_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
    }
}

/// Seam for the hosted configuration backend.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self, org_id: &str, config_id: &str) -> Result<Option<Arc<OrgConfig>>>;
}

/// Directory-backed store: `{root}/{org_id}/{config_id}.json`.
pub struct DirConfigStore {
    root: PathBuf,
}

impl DirConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ConfigStore for DirConfigStore {
    async fn load(&self, org_id: &str, config_id: &str) -> Result<Option<Arc<OrgConfig>>> {
        if !valid_id(org_id) || !valid_id(config_id) {
            return Err(CoreError::BadRequest(format!(
                "Malformed configuration id: {}/{}",
                org_id, config_id
            )));
        }
        let path = self.root.join(org_id).join(format!("{config_id}.json"));
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let config: OrgConfig = serde_json::from_slice(&raw)?;
        Ok(Some(Arc::new(config)))
    }
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> OrgConfig {
        serde_json::from_value(serde_json::json!({
            "kmId": "42",
            "displayName": "Acme",
            "defaultPrimaryLanguage": "en-US",
            "localization": [
                {
                    "language": "en-US",
                    "assistantId": "a1",
                    "assistantKey": "k1",
                    "generatorModel": "gpt-4.1-mini"
                },
                {
                    "language": "th-TH",
                    "assistantId": "a2",
                    "assistantKey": "k2"
                }
            ],
            "openai": { "apiKey": "sk-test" },
            "tts": {
                "azure": {
                    "subscriptionKey": "azure-key",
                    "models": [
                        { "language": "en-US", "name": "en-US-AriaNeural" }
                    ]
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn localization_falls_back_to_default_language() {
        let config = sample_config();
        let loc = config.localization_for("fr-FR").unwrap();
        assert_eq!(loc.language, "en-US");
    }

    #[test]
    fn exact_localization_wins_over_default() {
        let config = sample_config();
        let loc = config.localization_for("th-TH").unwrap();
        assert_eq!(loc.language, "th-TH");
    }

    #[test]
    fn voice_falls_back_to_default_language_model() {
        let config = sample_config();
        let voice = config.voice_for("th-TH").unwrap();
        assert_eq!(voice.name, "en-US-AriaNeural");
    }

    #[test]
    fn missing_subscription_key_reads_as_disabled() {
        let mut config = sample_config();
        config.tts.as_mut().unwrap().azure.subscription_key = Some("  ".into());
        assert!(config.tts_subscription_key().is_none());
    }
}
