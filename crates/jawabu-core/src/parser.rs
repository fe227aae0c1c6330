//! Incremental parser for the generator's token stream.
//!
//! Two shapes arrive from the model: plain answer text, or the sectioned
//! envelope `<sectionA>…</sectionA><sectionB>…</sectionB>` where section A
//! (minus any nested `<thinking>`) is the spoken answer and section B is the
//! display formatting. The stream may be truncated at any byte, so this is a
//! token scanner over a holdback buffer, never a full XML parse. Markers can
//! straddle chunk boundaries.
//!
//! `[meta:docs]` starts metadata capture; `{#NXENDX#}` ends the session and
//! discards the rest of the stream.

use serde_json::Value;
use tracing::debug;

pub const META_MARKER: &str = "[meta:docs]";
pub const SESSION_END_MARKER: &str = "{#NXENDX#}";

const SECTION_A_OPEN: &str = "<sectionA>";
const SECTION_A_CLOSE: &str = "</sectionA>";
const SECTION_B_OPEN: &str = "<sectionB>";
const SECTION_B_CLOSE: &str = "</sectionB>";
const THINKING_OPEN: &str = "<thinking>";
const THINKING_CLOSE: &str = "</thinking>";

/// How much leading non-envelope text a sectioned stream may produce before
/// the parser concludes the model ignored the envelope instructions.
const ENVELOPE_DETECT_LIMIT: usize = 64;

const TOKENS: &[&str] = &[
    SECTION_A_OPEN,
    SECTION_A_CLOSE,
    SECTION_B_OPEN,
    SECTION_B_CLOSE,
    THINKING_OPEN,
    THINKING_CLOSE,
    META_MARKER,
    SESSION_END_MARKER,
];

/// Output units, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedUnit {
    /// Spoken answer text: emitted as `answer_chunk` and forwarded to TTS.
    Answer(String),
    /// Model reasoning: emitted as `thinking`, never spoken.
    Thinking(String),
    /// Section B display text: emitted as `formatted_answer`, never spoken.
    Formatted(String),
    /// `{#NXENDX#}` was seen; the stream is over for the caller.
    SessionEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Sectioned mode, before `<sectionA>` arrives.
    Detect,
    /// Plain answer text (unsectioned mode, or envelope fallback).
    Answer,
    SectionA,
    Thinking,
    /// After `</sectionA>`, before `<sectionB>`; separator text is dropped.
    Between,
    SectionB,
    /// After `</sectionB>`; only metadata or the end marker may follow.
    AfterB,
    /// Accumulating metadata text.
    Metadata,
    Ended,
}

pub struct StreamParser {
    state: State,
    /// Where `</thinking>` returns to.
    thinking_return: State,
    /// Where a `</sectionA>` while capturing metadata returns to.
    metadata_in_section_a: bool,
    buffer: String,
    detect_buffer: String,
    metadata: String,
}

impl StreamParser {
    /// `sectioned` reflects the configured output format (a format prompt was
    /// fused into the system prompt).
    pub fn new(sectioned: bool) -> Self {
        Self {
            state: if sectioned { State::Detect } else { State::Answer },
            thinking_return: State::Answer,
            metadata_in_section_a: false,
            buffer: String::new(),
            detect_buffer: String::new(),
            metadata: String::new(),
        }
    }

    /// Feed one streamed fragment; parsed units are appended to `out`.
    pub fn push(&mut self, chunk: &str, out: &mut Vec<ParsedUnit>) {
        if self.state == State::Ended {
            return;
        }
        self.buffer.push_str(chunk);
        self.drain_buffer(out, false);
    }

    /// Signal end of stream. Remaining held-back text is flushed and the
    /// collected metadata, if any, is returned as a JSON value.
    pub fn finish(&mut self, out: &mut Vec<ParsedUnit>) -> Option<Value> {
        self.drain_buffer(out, true);
        let pending_detect = std::mem::take(&mut self.detect_buffer);
        if !pending_detect.trim().is_empty() {
            out.push(ParsedUnit::Answer(pending_detect));
        }
        parse_metadata(std::mem::take(&mut self.metadata))
    }

    fn drain_buffer(&mut self, out: &mut Vec<ParsedUnit>, at_end: bool) {
        loop {
            if self.state == State::Ended {
                self.buffer.clear();
                return;
            }
            let Some(special) = self.buffer.find(['<', '[', '{']) else {
                let text = std::mem::take(&mut self.buffer);
                self.emit_text(&text, out);
                return;
            };
            if special > 0 {
                let text: String = self.buffer.drain(..special).collect();
                self.emit_text(&text, out);
            }
            match match_token(&self.buffer) {
                TokenMatch::Complete(token) => {
                    self.buffer.drain(..token.len());
                    self.on_token(token, out);
                }
                TokenMatch::Partial if !at_end => {
                    // A marker may still be completing; hold the tail back.
                    return;
                }
                TokenMatch::Partial | TokenMatch::None => {
                    // Not a marker: the special character is ordinary text.
                    let ch: String = self.buffer.drain(..1).collect();
                    self.emit_text(&ch, out);
                }
            }
        }
    }

    fn on_token(&mut self, token: &'static str, out: &mut Vec<ParsedUnit>) {
        match token {
            SESSION_END_MARKER => {
                debug!("Session end marker found");
                out.push(ParsedUnit::SessionEnd);
                self.state = State::Ended;
            }
            META_MARKER => {
                self.metadata_in_section_a = self.state == State::SectionA;
                self.state = State::Metadata;
            }
            SECTION_A_OPEN if matches!(self.state, State::Detect | State::Answer) => {
                self.detect_buffer.clear();
                self.state = State::SectionA;
            }
            SECTION_A_CLOSE if self.state == State::SectionA => {
                self.state = State::Between;
            }
            SECTION_A_CLOSE if self.state == State::Metadata && self.metadata_in_section_a => {
                self.metadata_in_section_a = false;
                self.state = State::Between;
            }
            SECTION_B_OPEN if matches!(self.state, State::Between | State::SectionA) => {
                // A missing </sectionA> still ends section A here.
                self.state = State::SectionB;
            }
            SECTION_B_CLOSE if self.state == State::SectionB => {
                self.state = State::AfterB;
            }
            THINKING_OPEN
                if matches!(self.state, State::Detect | State::Answer | State::SectionA) =>
            {
                self.thinking_return = self.state;
                self.state = State::Thinking;
            }
            THINKING_CLOSE if self.state == State::Thinking => {
                self.state = self.thinking_return;
            }
            _ => {
                // Token is meaningless in this state; treat it as text.
                self.emit_text(token, out);
            }
        }
    }

    fn emit_text(&mut self, text: &str, out: &mut Vec<ParsedUnit>) {
        if text.is_empty() {
            return;
        }
        match self.state {
            State::Answer | State::SectionA => out.push(ParsedUnit::Answer(text.to_string())),
            State::Thinking => out.push(ParsedUnit::Thinking(text.to_string())),
            State::SectionB => out.push(ParsedUnit::Formatted(text.to_string())),
            State::Metadata => self.metadata.push_str(text),
            State::Detect => {
                self.detect_buffer.push_str(text);
                if self.detect_buffer.trim().len() > ENVELOPE_DETECT_LIMIT {
                    debug!("No section envelope detected, degrading to plain answer mode");
                    let pending = std::mem::take(&mut self.detect_buffer);
                    self.state = State::Answer;
                    out.push(ParsedUnit::Answer(pending));
                }
            }
            State::Between | State::AfterB | State::Ended => {}
        }
    }
}

enum TokenMatch {
    Complete(&'static str),
    Partial,
    None,
}

fn match_token(buffer: &str) -> TokenMatch {
    for token in TOKENS {
        if buffer.starts_with(token) {
            return TokenMatch::Complete(token);
        }
    }
    // Partial only when the entire remaining buffer could still complete a
    // token, i.e. the stream was cut mid-marker.
    for token in TOKENS {
        if !buffer.is_empty() && token.starts_with(buffer) {
            return TokenMatch::Partial;
        }
    }
    TokenMatch::None
}

/// Extract the JSON object trailing the metadata marker. The legacy producer
/// writes `doc-ids`; the wire field is `doc_ids`. Unparseable metadata is
/// surfaced raw rather than dropped.
fn parse_metadata(raw: String) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}');
    let candidate = match end {
        Some(end) if end > start => &trimmed[start..=end],
        _ => trimmed,
    };
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(mut map)) => {
            if let Some(ids) = map.remove("doc-ids") {
                map.insert("doc_ids".to_string(), ids);
            }
            Some(Value::Object(map))
        }
        _ => Some(serde_json::json!({ "raw": trimmed })),
    }
}
