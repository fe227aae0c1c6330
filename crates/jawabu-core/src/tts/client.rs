//! Speech synthesis client: vendor seam plus the cache read-through used by
//! the streaming buffers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::audio_cache::AudioCache;
use crate::error::{CoreError, Result};
use crate::org::TtsModel;
use crate::phoneme::{transform_fragment, PhonemeTable, DEFAULT_ILLEGAL_CHARS};
use crate::ssml::build_ssml;

pub const SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(20);
/// Output negotiated with the vendor; also fixes the cache key extension.
pub const OUTPUT_FORMAT: &str = "audio-16khz-128kbitrate-mono-mp3";
pub const OUTPUT_MEDIA_TYPE: &str = "audio/mpeg";

#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub media_type: String,
}

/// Vendor seam: turn an SSML document into audio.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, ssml: &str) -> Result<SynthesizedAudio>;
}

/// Azure Cognitive Services speech endpoint.
pub struct AzureSpeechClient {
    http: reqwest::Client,
    endpoint: String,
    subscription_key: String,
}

impl AzureSpeechClient {
    pub fn new(http: reqwest::Client, region: &str, subscription_key: &str) -> Self {
        Self {
            http,
            endpoint: format!("https://{region}.tts.speech.microsoft.com/cognitiveservices/v1"),
            subscription_key: subscription_key.to_string(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for AzureSpeechClient {
    async fn synthesize(&self, ssml: &str) -> Result<SynthesizedAudio> {
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(SYNTHESIS_TIMEOUT)
            .header("Ocp-Apim-Subscription-Key", &self.subscription_key)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", OUTPUT_FORMAT)
            .body(ssml.to_string())
            .send()
            .await
            .map_err(|e| CoreError::TtsFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::TtsFailed(format!("HTTP {status}: {body}")));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CoreError::TtsFailed(e.to_string()))?;
        debug!(size = bytes.len(), "Synthesized audio chunk");
        Ok(SynthesizedAudio {
            bytes: bytes.to_vec(),
            media_type: OUTPUT_MEDIA_TYPE.to_string(),
        })
    }
}

/// Normalisation applied before keying and synthesis: edge whitespace
/// stripped, internal runs collapsed, lowercased only for voices that do not
/// distinguish case (per-model, so keys stay stable).
pub fn normalise_for_voice(text: &str, case_sensitive: bool) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if case_sensitive {
        collapsed
    } else {
        collapsed.to_lowercase()
    }
}

/// Render seam consumed by the TTS buffers; lets tests record synthesis
/// traffic without a vendor.
#[async_trait]
pub trait SpeechRenderer: Send + Sync {
    async fn render(
        &self,
        plain_text: &str,
        model: &TtsModel,
        table: &PhonemeTable,
    ) -> Result<SynthesizedAudio>;
}

/// Cache read-through renderer: audio cache first, vendor second, store
/// write-behind on success only.
pub struct TtsRenderer {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    cache: AudioCache,
}

impl TtsRenderer {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, cache: AudioCache) -> Self {
        Self { synthesizer, cache }
    }
}

#[async_trait]
impl SpeechRenderer for TtsRenderer {
    async fn render(
        &self,
        plain_text: &str,
        model: &TtsModel,
        table: &PhonemeTable,
    ) -> Result<SynthesizedAudio> {
        let normalised = normalise_for_voice(plain_text, model.case_sensitive);
        let key = AudioCache::cache_key(&normalised, &model.language, &model.name, OUTPUT_MEDIA_TYPE);

        if let Some(hit) = self.cache.lookup(&key).await {
            return Ok(SynthesizedAudio {
                bytes: hit.bytes,
                media_type: hit.media_type,
            });
        }

        let transformed = transform_fragment(&normalised, table, DEFAULT_ILLEGAL_CHARS);
        let ssml = build_ssml(&transformed, model, &model.language);
        let audio = self.synthesizer.synthesize(&ssml).await?;
        self.cache
            .store_behind(key, audio.bytes.clone(), audio.media_type.clone());
        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_cache::MemoryObjectStore;
    use crate::phoneme::PhonemeTable;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSynthesizer {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingSynthesizer {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for CountingSynthesizer {
        async fn synthesize(&self, ssml: &str) -> Result<SynthesizedAudio> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CoreError::TtsFailed("vendor down".into()));
            }
            Ok(SynthesizedAudio {
                bytes: ssml.as_bytes().to_vec(),
                media_type: OUTPUT_MEDIA_TYPE.to_string(),
            })
        }
    }

    fn model() -> TtsModel {
        TtsModel {
            language: "en-US".into(),
            name: "en-US-AriaNeural".into(),
            pitch: None,
            phoneme_url: None,
            case_sensitive: false,
        }
    }

    #[test]
    fn normalisation_collapses_whitespace_and_lowercases() {
        assert_eq!(normalise_for_voice("  Hello   World \n", false), "hello world");
        assert_eq!(normalise_for_voice("  Hello   World \n", true), "Hello World");
    }

    #[tokio::test]
    async fn render_hits_cache_on_second_call() {
        let synthesizer = CountingSynthesizer::new(false);
        let cache = AudioCache::new(Arc::new(MemoryObjectStore::default()));
        let renderer = TtsRenderer::new(synthesizer.clone(), cache);
        let table = PhonemeTable::empty();

        let first = renderer.render("Hello world", &model(), &table).await.unwrap();
        // Let the write-behind land before the second render.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        let second = renderer.render("Hello world", &model(), &table).await.unwrap();

        assert_eq!(synthesizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.bytes, second.bytes);
    }

    #[tokio::test]
    async fn vendor_failure_is_not_cached() {
        let synthesizer = CountingSynthesizer::new(true);
        let cache = AudioCache::new(Arc::new(MemoryObjectStore::default()));
        let renderer = TtsRenderer::new(synthesizer.clone(), cache);
        let table = PhonemeTable::empty();

        let err = renderer.render("Hello", &model(), &table).await.unwrap_err();
        assert!(matches!(err, CoreError::TtsFailed(_)));

        let again = renderer.render("Hello", &model(), &table).await.unwrap_err();
        assert!(matches!(again, CoreError::TtsFailed(_)));
        assert_eq!(synthesizer.calls.load(Ordering::SeqCst), 2);
    }
}
