//! Incremental text-to-speech: buffering, per-language streaming, and the
//! vendor client with its cache read-through.

pub mod buffer;
pub mod client;
pub mod streamer;

pub use buffer::{AudioChunk, AudioDelivery, TtsBuffer, TtsBufferConfig};
pub use client::{
    normalise_for_voice, AzureSpeechClient, SpeechRenderer, SpeechSynthesizer, SynthesizedAudio,
    TtsRenderer,
};
pub use streamer::TtsStreamer;
