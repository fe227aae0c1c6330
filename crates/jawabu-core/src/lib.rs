//! jawabu-core: the streaming answer pipeline runtime.
//!
//! One request flows validation → knowledge retrieval → streamed generation,
//! with incremental speech synthesis riding alongside the text stream. The
//! pieces here are transport-agnostic; the HTTP server crate wires them to
//! axum and SSE.

pub mod audio_cache;
pub mod config;
pub mod error;
pub mod events;
pub mod flow;
pub mod generator;
pub mod km;
pub mod org;
pub mod parser;
pub mod phoneme;
pub mod request;
pub mod ssml;
pub mod template_cache;
pub mod tts;
pub mod validator;

pub use config::AppConfig;
pub use error::{CoreError, Result};
pub use events::{Event, EventSink, SinkMessage};
pub use flow::{AnswerFlow, FlowDeps};
pub use org::{ConfigStore, DirConfigStore, OrgConfig};
pub use request::AnswerRequest;
