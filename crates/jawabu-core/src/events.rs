//! Ordered SSE event sink with a multi-party completion registry.
//!
//! Every producer of a request (orchestrator, TTS workers, error handlers)
//! pushes typed events through one [`EventSink`]; the HTTP layer drains the
//! paired receiver into the response body. The stream closes only once every
//! registered component has been marked complete, or a fatal error forces
//! closure.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::km::KmSearchResponse;
use crate::validator::ValidationOutcome;

/// Default depth of the per-stream queue. Writers block (never drop) when
/// the consumer falls this far behind.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

pub const COMPONENT_TEXT_GENERATION: &str = "text_generation";
pub const COMPONENT_TTS_PROCESSING: &str = "tts_processing";

/// Payload of a `tts_audio` event.
#[derive(Debug, Clone, Serialize)]
pub struct TtsAudioData {
    pub text: String,
    pub language: String,
    pub audio_size: usize,
    pub audio_data: String,
    pub audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_final: Option<bool>,
}

/// A pipeline event, prior to envelope framing.
#[derive(Debug, Clone)]
pub enum Event {
    Status(String),
    ValidationResult(ValidationOutcome),
    KmResult(KmSearchResponse),
    Thinking(String),
    AnswerChunk(String),
    FormattedAnswer(String),
    Metadata(serde_json::Value),
    TtsAudio(TtsAudioData),
    Complete(String),
    Error(String),
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

impl Event {
    fn kind(&self) -> &'static str {
        match self {
            Event::Status(_) => "status",
            Event::ValidationResult(_) => "validation_result",
            Event::KmResult(_) => "km_result",
            Event::Thinking(_) => "thinking",
            Event::AnswerChunk(_) => "answer_chunk",
            Event::FormattedAnswer(_) => "formatted_answer",
            Event::Metadata(_) => "metadata",
            Event::TtsAudio(_) => "tts_audio",
            Event::Complete(_) => "complete",
            Event::Error(_) => "error",
        }
    }

    /// Serialize into the wire envelope with an emission timestamp.
    pub fn to_frame(&self) -> String {
        let data = match self {
            Event::Status(_) | Event::Complete(_) | Event::Error(_) => None,
            Event::ValidationResult(v) => serde_json::to_value(v).ok(),
            Event::KmResult(v) => serde_json::to_value(v).ok(),
            Event::Thinking(content) | Event::AnswerChunk(content) | Event::FormattedAnswer(content) => {
                Some(serde_json::json!({ "content": content }))
            }
            Event::Metadata(v) => Some(v.clone()),
            Event::TtsAudio(v) => serde_json::to_value(v).ok(),
        };
        let message = match self {
            Event::Status(m) | Event::Complete(m) | Event::Error(m) => Some(m.as_str()),
            _ => None,
        };
        let envelope = Envelope {
            kind: self.kind(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message,
            data,
        };
        serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Messages carried on the sink channel. `Close` terminates the consumer.
#[derive(Debug)]
pub enum SinkMessage {
    Event(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
}

struct SinkState {
    components: Vec<(String, bool)>,
    phase: Phase,
    any_marked: bool,
}

/// Single-writer ordered event emitter. Cheap to clone; all clones share the
/// queue and the completion registry.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SinkMessage>,
    state: Arc<Mutex<SinkState>>,
}

impl EventSink {
    /// Create a sink and the receiver the HTTP layer drains.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<SinkMessage>) {
        let (tx, rx) = mpsc::channel(depth);
        let sink = Self {
            tx,
            state: Arc::new(Mutex::new(SinkState {
                components: Vec::new(),
                phase: Phase::Open,
                any_marked: false,
            })),
        };
        (sink, rx)
    }

    /// Register a producer that must finish before the stream may close.
    /// Must happen before the component's first event and before any
    /// component completes.
    pub fn register_component(&self, name: &str) {
        let mut state = self.state.lock();
        if state.any_marked {
            warn!(component = name, "Component registered after completion began");
        }
        if state.components.iter().any(|(n, _)| n == name) {
            return;
        }
        state.components.push((name.to_string(), false));
        debug!(component = name, "Registered completion component");
    }

    /// Append an event to the stream. Blocks while the queue is full;
    /// a no-op once the stream is closing or closed.
    pub async fn emit(&self, event: Event) {
        if self.state.lock().phase != Phase::Open {
            return;
        }
        let frame = event.to_frame();
        if self.tx.send(SinkMessage::Event(frame)).await.is_err() {
            // Receiver dropped: the client went away.
            self.state.lock().phase = Phase::Closed;
        }
    }

    /// Emit an `error` event. Does not close the stream by itself.
    pub async fn error(&self, err: &CoreError) {
        self.emit(Event::Error(err.to_string())).await;
    }

    /// Mark one component done. Idempotent; the false→true transition
    /// happens exactly once. When the registry becomes all-true this emits
    /// the single `complete` event and closes the stream.
    pub async fn mark_component_complete(&self, name: &str) {
        let close_now = {
            let mut state = self.state.lock();
            let Some(entry) = state.components.iter_mut().find(|(n, _)| n == name) else {
                warn!(component = name, "Unknown completion component");
                return;
            };
            if entry.1 {
                debug!(component = name, "Component already complete");
                return;
            }
            entry.1 = true;
            state.any_marked = true;
            debug!(component = name, "Component complete");
            let all_done =
                !state.components.is_empty() && state.components.iter().all(|(_, done)| *done);
            if all_done && state.phase == Phase::Open {
                state.phase = Phase::Closing;
                true
            } else {
                false
            }
        };
        if close_now {
            self.finish(Some("Answer pipeline completed successfully"))
                .await;
        }
    }

    /// Legacy primitive: mark every registered component complete.
    pub async fn mark_complete(&self) {
        let names: Vec<String> = {
            let state = self.state.lock();
            state.components.iter().map(|(n, _)| n.clone()).collect()
        };
        if names.is_empty() {
            // Nothing registered: behave like the pre-registry protocol.
            let proceed = {
                let mut state = self.state.lock();
                if state.phase == Phase::Open {
                    state.phase = Phase::Closing;
                    true
                } else {
                    false
                }
            };
            if proceed {
                self.finish(Some("Answer pipeline completed successfully"))
                    .await;
            }
            return;
        }
        for name in names {
            self.mark_component_complete(&name).await;
        }
    }

    /// Fatal termination: close the stream without a `complete` event.
    pub async fn close_fatal(&self) {
        let proceed = {
            let mut state = self.state.lock();
            if state.phase == Phase::Open {
                state.phase = Phase::Closing;
                true
            } else {
                false
            }
        };
        if proceed {
            self.finish(None).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().phase != Phase::Open
    }

    /// Drain point: emit the optional `complete`, push the close sentinel,
    /// transition to `Closed`.
    async fn finish(&self, complete_message: Option<&str>) {
        if let Some(message) = complete_message {
            let frame = Event::Complete(message.to_string()).to_frame();
            let _ = self.tx.send(SinkMessage::Event(frame)).await;
        }
        let _ = self.tx.send(SinkMessage::Close).await;
        self.state.lock().phase = Phase::Closed;
    }
}
