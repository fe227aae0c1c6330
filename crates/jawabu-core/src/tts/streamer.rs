//! Per-request TTS coordination: one buffer per language, lazy construction,
//! and the `tts_processing` completion latch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::events::{Event, EventSink, TtsAudioData, COMPONENT_TTS_PROCESSING};
use crate::org::OrgConfig;
use crate::phoneme::PhonemeLibrary;
use crate::tts::buffer::{AudioChunk, AudioDelivery, TtsBuffer, TtsBufferConfig};
use crate::tts::client::SpeechRenderer;

/// Pushes finished audio (and synthesis failures) onto the event stream.
struct SinkDelivery {
    sink: EventSink,
}

#[async_trait]
impl AudioDelivery for SinkDelivery {
    async fn audio_ready(&self, chunk: AudioChunk) {
        let encoded = BASE64.encode(&chunk.audio.bytes);
        self.sink
            .emit(Event::TtsAudio(TtsAudioData {
                text: chunk.text,
                language: chunk.language,
                audio_size: chunk.audio.bytes.len(),
                audio_data: encoded,
                audio_format: chunk.audio.media_type,
                chunk_index: Some(chunk.chunk_index),
                total_chunks: None,
                is_final: chunk.is_final.then_some(true),
            }))
            .await;
    }

    async fn synthesis_failed(&self, language: &str, error: &CoreError) {
        warn!(language, error = %error, "Synthesis failure surfaced to stream");
        self.sink.error(error).await;
    }
}

struct BufferEntry {
    buffer: TtsBuffer,
    done: Option<oneshot::Receiver<()>>,
}

/// Owns the per-language buffers of one request. When no subscription key is
/// configured the streamer is inert: appends are no-ops and `close` completes
/// immediately, but `tts_processing` is still resolved so the stream cannot
/// hang.
pub struct TtsStreamer {
    org: Arc<OrgConfig>,
    renderer: Arc<dyn SpeechRenderer>,
    phonemes: Arc<PhonemeLibrary>,
    sink: EventSink,
    delivery: Arc<dyn AudioDelivery>,
    config: TtsBufferConfig,
    enabled: bool,
    buffers: Mutex<HashMap<String, BufferEntry>>,
}

impl TtsStreamer {
    pub fn new(
        org: Arc<OrgConfig>,
        renderer: Arc<dyn SpeechRenderer>,
        phonemes: Arc<PhonemeLibrary>,
        sink: EventSink,
    ) -> Self {
        let enabled = org.tts_subscription_key().is_some();
        if !enabled {
            info!("TTS subscription key absent, streamer is inert");
        }
        let delivery: Arc<dyn AudioDelivery> = Arc::new(SinkDelivery { sink: sink.clone() });
        Self {
            org,
            renderer,
            phonemes,
            sink,
            delivery,
            config: TtsBufferConfig::default(),
            enabled,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_buffer_config(mut self, config: TtsBufferConfig) -> Self {
        self.config = config;
        self
    }

    /// Route an answer fragment to the buffer for its language, creating the
    /// buffer on first use.
    pub async fn add_text_chunk(&self, text: &str, language: &str) {
        if !self.enabled || text.is_empty() {
            return;
        }
        let Some(model) = self.org.voice_for(language).cloned() else {
            warn!(language, "No TTS voice configured, skipping fragment");
            return;
        };
        let key = format!("{}_{}", language, model.name);

        let mut buffers = self.buffers.lock().await;
        if !buffers.contains_key(&key) {
            let azure = &self.org.tts.as_ref().expect("enabled implies tts config").azure;
            let table = self.phonemes.table_for(azure, &model.language).await;
            debug!(language, voice = %model.name, "Creating TTS buffer");
            let (buffer, done) = TtsBuffer::new(
                self.config,
                language.to_string(),
                Arc::new(model),
                table,
                self.renderer.clone(),
                self.delivery.clone(),
            );
            buffers.insert(
                key.clone(),
                BufferEntry {
                    buffer,
                    done: Some(done),
                },
            );
        }
        buffers
            .get(&key)
            .expect("buffer just inserted")
            .buffer
            .append(text);
    }

    /// Flush every buffer's pending text.
    pub async fn flush_all(&self) {
        let buffers = self.buffers.lock().await;
        for entry in buffers.values() {
            entry.buffer.flush();
        }
    }

    /// Close every buffer, wait for their workers to drain, then resolve the
    /// `tts_processing` component.
    pub async fn close(&self) {
        if self.enabled {
            let latches: Vec<oneshot::Receiver<()>> = {
                let mut buffers = self.buffers.lock().await;
                buffers
                    .values_mut()
                    .filter_map(|entry| {
                        entry.buffer.close();
                        entry.done.take()
                    })
                    .collect()
            };
            for latch in latches {
                let _ = latch.await;
            }
            info!("All TTS buffers drained");
        }
        self.sink
            .mark_component_complete(COMPONENT_TTS_PROCESSING)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::events::{EventSink, SinkMessage, DEFAULT_QUEUE_DEPTH};
    use crate::org::{AzureTtsConfig, Localization, OpenAiConfig, TtsConfig, TtsModel};
    use crate::phoneme::PhonemeTable;
    use crate::template_cache::{TemplateCache, TemplateFetcher};
    use crate::tts::client::{SynthesizedAudio, OUTPUT_MEDIA_TYPE};
    use parking_lot::Mutex as SyncMutex;
    use std::time::Duration;

    struct NoFetch;

    #[async_trait]
    impl TemplateFetcher for NoFetch {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            Err(CoreError::UpstreamUnavailable(url.to_string()))
        }
    }

    struct RecordingRenderer {
        renders: SyncMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SpeechRenderer for RecordingRenderer {
        async fn render(
            &self,
            plain_text: &str,
            model: &TtsModel,
            _table: &PhonemeTable,
        ) -> Result<SynthesizedAudio> {
            self.renders
                .lock()
                .push((plain_text.to_string(), model.name.clone()));
            Ok(SynthesizedAudio {
                bytes: vec![0xAB; 4],
                media_type: OUTPUT_MEDIA_TYPE.to_string(),
            })
        }
    }

    fn org(with_key: bool) -> Arc<OrgConfig> {
        Arc::new(OrgConfig {
            km_id: "1".into(),
            display_name: "Acme".into(),
            default_primary_language: "en-US".into(),
            localization: vec![Localization {
                language: "en-US".into(),
                assistant_id: "a".into(),
                assistant_key: "k".into(),
                generator_model: None,
                system_prompt: None,
                generator_format_text_prompt_url: None,
                validator_system_prompt_template_url: None,
                validator_transcript_prompt_template_url: None,
            }],
            openai: OpenAiConfig {
                api_key: "sk".into(),
            },
            groq: None,
            validator: None,
            tts: Some(TtsConfig {
                azure: AzureTtsConfig {
                    subscription_key: with_key.then(|| "azure-key".to_string()),
                    region: "southeastasia".into(),
                    phoneme_url: None,
                    models: vec![
                        TtsModel {
                            language: "en-US".into(),
                            name: "en-US-AriaNeural".into(),
                            pitch: None,
                            phoneme_url: None,
                            case_sensitive: false,
                        },
                        TtsModel {
                            language: "th-TH".into(),
                            name: "th-TH-PremwadeeNeural".into(),
                            pitch: None,
                            phoneme_url: None,
                            case_sensitive: false,
                        },
                    ],
                },
            }),
        })
    }

    fn streamer(with_key: bool, sink: EventSink) -> (TtsStreamer, Arc<RecordingRenderer>) {
        let renderer = Arc::new(RecordingRenderer {
            renders: SyncMutex::new(Vec::new()),
        });
        let templates = Arc::new(TemplateCache::new(Arc::new(NoFetch)));
        let phonemes = Arc::new(PhonemeLibrary::new(templates));
        let streamer = TtsStreamer::new(org(with_key), renderer.clone(), phonemes, sink)
            .with_buffer_config(TtsBufferConfig {
                min_words: 3,
                max_wait: Duration::from_secs(2),
            });
        (streamer, renderer)
    }

    async fn drain_kinds(mut rx: tokio::sync::mpsc::Receiver<SinkMessage>) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Some(message) = rx.recv().await {
            match message {
                SinkMessage::Event(frame) => {
                    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
                    kinds.push(value["type"].as_str().unwrap().to_string());
                }
                SinkMessage::Close => break,
            }
        }
        kinds
    }

    #[tokio::test]
    async fn fragments_route_to_per_language_buffers() {
        let (sink, rx) = EventSink::channel(DEFAULT_QUEUE_DEPTH);
        sink.register_component(COMPONENT_TTS_PROCESSING);
        let (streamer, renderer) = streamer(true, sink);

        streamer.add_text_chunk("Hello english world ", "en-US").await;
        streamer.add_text_chunk("สวัสดีครับ ยินดีต้อนรับ ครับ ", "th-TH").await;
        streamer.close().await;

        let renders = renderer.renders.lock().clone();
        assert_eq!(renders.len(), 2);
        assert!(renders
            .iter()
            .any(|(text, voice)| text.starts_with("Hello") && voice == "en-US-AriaNeural"));
        assert!(renders
            .iter()
            .any(|(_, voice)| voice == "th-TH-PremwadeeNeural"));

        let kinds = drain_kinds(rx).await;
        assert_eq!(kinds.iter().filter(|k| *k == "tts_audio").count(), 2);
        assert_eq!(kinds.last().unwrap(), "complete");
    }

    #[tokio::test]
    async fn unknown_language_falls_back_to_default_voice() {
        let (sink, _rx) = EventSink::channel(DEFAULT_QUEUE_DEPTH);
        sink.register_component(COMPONENT_TTS_PROCESSING);
        let (streamer, renderer) = streamer(true, sink);

        streamer.add_text_chunk("Bonjour tout le monde ", "fr-FR").await;
        streamer.close().await;

        let renders = renderer.renders.lock().clone();
        assert_eq!(renders.len(), 1);
        assert_eq!(renders[0].1, "en-US-AriaNeural");
    }

    #[tokio::test]
    async fn inert_streamer_still_resolves_its_component() {
        let (sink, rx) = EventSink::channel(DEFAULT_QUEUE_DEPTH);
        sink.register_component(COMPONENT_TTS_PROCESSING);
        let (streamer, renderer) = streamer(false, sink);

        streamer.add_text_chunk("never spoken aloud ", "en-US").await;
        streamer.close().await;

        assert!(renderer.renders.lock().is_empty());
        let kinds = drain_kinds(rx).await;
        assert_eq!(kinds, vec!["complete"]);
    }

    #[tokio::test]
    async fn tts_audio_events_carry_base64_payload() {
        let (sink, mut rx) = EventSink::channel(DEFAULT_QUEUE_DEPTH);
        sink.register_component(COMPONENT_TTS_PROCESSING);
        let (streamer, _renderer) = streamer(true, sink);

        streamer.add_text_chunk("one two three ", "en-US").await;
        streamer.close().await;

        let mut saw_audio = false;
        while let Some(message) = rx.recv().await {
            match message {
                SinkMessage::Event(frame) => {
                    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
                    if value["type"] == "tts_audio" {
                        saw_audio = true;
                        assert_eq!(value["data"]["language"], "en-US");
                        assert_eq!(value["data"]["audio_size"], 4);
                        assert_eq!(value["data"]["audio_format"], OUTPUT_MEDIA_TYPE);
                        let decoded = BASE64
                            .decode(value["data"]["audio_data"].as_str().unwrap())
                            .unwrap();
                        assert_eq!(decoded, vec![0xAB; 4]);
                    }
                }
                SinkMessage::Close => break,
            }
        }
        assert!(saw_audio);
    }
}
