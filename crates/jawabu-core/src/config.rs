//! Process configuration read from the environment at startup.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Environment-driven settings shared by every request.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Upstream request timeout for provider calls.
    pub request_timeout: Duration,
    /// End-to-end budget for one answer pipeline; hitting it is fatal for
    /// the stream.
    pub pipeline_timeout: Duration,
    /// Knowledge-management search endpoint.
    pub km_api_url: String,
    /// Bearer token for the KM API.
    pub km_token: String,
    /// OpenAI-compatible chat completions base URL.
    pub openai_api_base_url: String,
    /// Groq chat completions base URL (used for `groq/` models).
    pub groq_api_base_url: String,
    /// Validator provider base URL.
    pub validator_api_base_url: String,
    /// Allowed CORS origins; `*` means any.
    pub cors_origins: Vec<String>,
    /// Directory holding organisation configuration documents.
    pub org_config_dir: PathBuf,
    /// Local directory backing the audio cache.
    pub audio_cache_dir: PathBuf,
    /// DynamoDB coordinates for the hosted config store (collaborator).
    pub dynamodb_table: String,
    pub dynamodb_region: String,
    /// Application Insights connection string, surfaced in the startup log.
    pub app_insights_connection: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            request_timeout: Duration::from_secs(parse_env("REQUEST_TIMEOUT_SECS", 30)),
            pipeline_timeout: Duration::from_secs(parse_env("PIPELINE_TIMEOUT_SECS", 300)),
            km_api_url: env_or("KM_API_URL", "https://api.amitysolutions.com/api/v1/km/search"),
            km_token: env_or("KM_TOKEN", ""),
            openai_api_base_url: env_or("OPENAI_API_BASE_URL", "https://api.openai.com/v1"),
            groq_api_base_url: env_or("GROQ_API_BASE_URL", "https://api.groq.com/openai/v1"),
            validator_api_base_url: env_or(
                "VALIDATOR_API_BASE_URL",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            cors_origins: env_list("CORS_ORIGINS", "*"),
            org_config_dir: PathBuf::from(env_or("ORG_CONFIG_DIR", "org-configs")),
            audio_cache_dir: PathBuf::from(env_or("AUDIO_CACHE_DIR", "tts-cache")),
            dynamodb_table: env_or("DYNAMODB_TABLE_NAME", "AnswerConfigTable-prod"),
            dynamodb_region: env_or("DYNAMODB_REGION", "ap-southeast-1"),
            app_insights_connection: std::env::var("APPLICATIONINSIGHTS_CONNECTION_STRING")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(raw) => {
            let value = raw.trim();
            if value.is_empty() {
                default.to_string()
            } else {
                value.to_string()
            }
        }
        Err(_) => default.to_string(),
    }
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    env_or(key, default)
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_env(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Invalid {}='{}', falling back to {}", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}
