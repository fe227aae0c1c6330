//! Silence trimming for recorded question audio.

use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::wav;
use crate::error::ApiError;

const DEFAULT_SILENCE_THRESHOLD: f32 = 0.05;

#[derive(Debug, Deserialize)]
pub struct TrimRequest {
    /// Base64-encoded 16-bit PCM WAV.
    pub audio: String,
    #[serde(default)]
    pub threshold: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct TrimResponse {
    pub audio: String,
    pub audio_format: &'static str,
    pub original_size: usize,
    pub trimmed_size: usize,
}

pub async fn trim_audio(Json(request): Json<TrimRequest>) -> Result<Json<TrimResponse>, ApiError> {
    let bytes = BASE64
        .decode(&request.audio)
        .map_err(|e| ApiError::bad_request(format!("Invalid base64 audio: {e}")))?;
    let parsed = wav::parse_wav(&bytes).map_err(ApiError::bad_request)?;

    let threshold = request
        .threshold
        .unwrap_or(DEFAULT_SILENCE_THRESHOLD)
        .clamp(0.0, 1.0);
    let trimmed = wav::trim_silence(&parsed.samples, threshold);
    let out = wav::write_wav(parsed.format, trimmed);
    info!(
        original = bytes.len(),
        trimmed = out.len(),
        "Trimmed audio"
    );

    Ok(Json(TrimResponse {
        audio: BASE64.encode(&out),
        audio_format: "wav",
        original_size: bytes.len(),
        trimmed_size: out.len(),
    }))
}
