//! The answer pipeline orchestrator.
//!
//! Runs validation → retrieval → generation for one request, fanning events
//! into the sink and answer text into the TTS streamer. The orchestrator
//! never closes the sink itself: it resolves the `text_generation` component
//! and leaves closure to the completion registry, except on fatal errors
//! where it closes the stream without a `complete`.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::events::{Event, EventSink, COMPONENT_TEXT_GENERATION, COMPONENT_TTS_PROCESSING};
use crate::generator::{
    AnswerGenerator, GenerationRequest, PromptMessage, DEFAULT_GENERATOR_MODEL,
    DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, GROQ_MODEL_PREFIX,
};
use crate::km::{KmQuery, KmSearchResponse, KnowledgeSearch};
use crate::org::{Localization, OrgConfig};
use crate::parser::{ParsedUnit, StreamParser};
use crate::request::{AnswerRequest, ChatRole};
use crate::template_cache::TemplateCache;
use crate::tts::streamer::TtsStreamer;
use crate::validator::{ValidationOutcome, ValidationPrompts, ValidationRequest, Validator};

pub const STATUS_STARTING: &str = "Starting answer pipeline";
pub const STATUS_SKIP_VALIDATION: &str = "Skipping validation – using provided keywords";
pub const STATUS_VALIDATOR_FALLBACK: &str =
    "Validator unavailable – continuing with the raw transcript";
pub const STATUS_KM_FALLBACK: &str = "Knowledge search unavailable – continuing without documents";
pub const STATUS_SESSION_ENDED: &str = "SESSION_ENDED";

/// Upstream seams the orchestrator drives.
#[derive(Clone)]
pub struct FlowDeps {
    pub validator: Arc<dyn Validator>,
    pub km: Arc<dyn KnowledgeSearch>,
    pub generator: Arc<dyn AnswerGenerator>,
    pub templates: Arc<TemplateCache>,
}

pub struct AnswerFlow {
    request: AnswerRequest,
    org: Arc<OrgConfig>,
    sink: EventSink,
    tts: Option<Arc<TtsStreamer>>,
    deps: FlowDeps,
    cancel: CancellationToken,
}

impl AnswerFlow {
    pub fn new(
        request: AnswerRequest,
        org: Arc<OrgConfig>,
        sink: EventSink,
        tts: Option<Arc<TtsStreamer>>,
        deps: FlowDeps,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request,
            org,
            sink,
            tts,
            deps,
            cancel,
        }
    }

    /// Run the pipeline to completion. Every exit path resolves the
    /// registered components or closes the stream fatally; the stream never
    /// hangs.
    pub async fn run(self) {
        // Stage 1: registration precedes any component's events.
        self.sink.emit(Event::Status(STATUS_STARTING.into())).await;
        self.sink.register_component(COMPONENT_TEXT_GENERATION);
        if self.tts.is_some() {
            self.sink.register_component(COMPONENT_TTS_PROCESSING);
        }

        let localization = match self.org.localization_for(&self.request.language) {
            Ok(loc) => loc.clone(),
            Err(err) => {
                self.fatal(err).await;
                return;
            }
        };

        // Stage 2: validation.
        let outcome = match self.validation_stage(&localization).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.fatal(err).await;
                return;
            }
        };
        self.sink
            .emit(Event::ValidationResult(outcome.clone()))
            .await;

        // Stage 3: retrieval. An empty result set is not an error.
        let km_result = self.retrieval_stage(&outcome).await;
        self.sink.emit(Event::KmResult(km_result.clone())).await;

        if !self.request.generate_answer.unwrap_or(true) {
            info!("generate_answer=false, stopping after retrieval");
            self.finalize().await;
            return;
        }

        // Stage 4: generation.
        if let Err(err) = self.generation_stage(&localization, &outcome, &km_result).await {
            if matches!(err, CoreError::UpstreamUnavailable(_) | CoreError::Config(_)) {
                self.fatal(err).await;
                return;
            }
            // LLMFailed: the text producer is done, TTS drains what it has.
            self.sink.error(&err).await;
        }

        // Stage 5: finalise.
        self.finalize().await;
    }

    async fn validation_stage(&self, localization: &Localization) -> Result<ValidationOutcome> {
        // Keyword presence, even empty, is the skip signal.
        if let Some(keywords) = self.request.keywords.clone() {
            self.sink
                .emit(Event::Status(STATUS_SKIP_VALIDATION.into()))
                .await;
            return Ok(ValidationOutcome {
                correction: self.request.transcript.clone(),
                keywords,
            });
        }

        match self.run_validator(localization).await {
            Ok(outcome) => {
                info!(correction = %outcome.correction, "Validation complete");
                Ok(outcome)
            }
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, "Validator failed, falling back to identity validation");
                self.sink
                    .emit(Event::Status(STATUS_VALIDATOR_FALLBACK.into()))
                    .await;
                Ok(ValidationOutcome::identity(&self.request.transcript, vec![]))
            }
            Err(err) => Err(err),
        }
    }

    async fn run_validator(&self, localization: &Localization) -> Result<ValidationOutcome> {
        let Some(validator_config) = &self.org.validator else {
            return Err(CoreError::ValidatorFailed(
                "No validator configured for organisation".into(),
            ));
        };
        let (Some(system_url), Some(user_url)) = (
            &localization.validator_system_prompt_template_url,
            &localization.validator_transcript_prompt_template_url,
        ) else {
            return Err(CoreError::ValidatorFailed(
                "Validator prompt templates not configured".into(),
            ));
        };
        // A template miss with no cached fallback is fatal by design.
        let system = self.deps.templates.fetch_text(system_url).await?;
        let user_template = self.deps.templates.fetch_text(user_url).await?;
        let user = user_template.replace("{transcript}", &self.request.transcript);

        let audio = match &self.request.audio {
            Some(encoded) => Some(
                BASE64
                    .decode(encoded)
                    .map_err(|e| CoreError::ValidatorFailed(format!("Invalid audio payload: {e}")))?,
            ),
            None => None,
        };

        self.deps
            .validator
            .validate(&ValidationRequest {
                prompts: ValidationPrompts { system, user },
                language: self.request.language.clone(),
                transcript: self.request.transcript.clone(),
                audio,
                chat_history: self.request.chat_history.clone(),
                model: validator_config.model.clone(),
                api_key: validator_config.api_key.clone(),
            })
            .await
    }

    async fn retrieval_stage(&self, outcome: &ValidationOutcome) -> KmSearchResponse {
        let query = KmQuery {
            query: outcome.correction.clone(),
            keywords: outcome.keywords.clone(),
            language: self.request.language.clone(),
            km_id: self.org.km_id.clone(),
        };
        match self.deps.km.search(&query).await {
            Ok(result) => {
                info!(total = result.total, "Knowledge search complete");
                result
            }
            Err(err) => {
                warn!(error = %err, "Knowledge search failed, continuing without documents");
                self.sink
                    .emit(Event::Status(STATUS_KM_FALLBACK.into()))
                    .await;
                KmSearchResponse::default()
            }
        }
    }

    async fn generation_stage(
        &self,
        localization: &Localization,
        outcome: &ValidationOutcome,
        km_result: &KmSearchResponse,
    ) -> Result<()> {
        let system_url = localization.system_prompt.as_deref().ok_or_else(|| {
            CoreError::Config(format!(
                "No system prompt configured for language {}",
                localization.language
            ))
        })?;
        let system_prompt = self.deps.templates.fetch_text(system_url).await?;

        // The format prompt turns on the sectioned envelope; losing it only
        // costs the formatted rendition.
        let format_prompt = match &localization.generator_format_text_prompt_url {
            Some(url) => match self.deps.templates.fetch_text(url).await {
                Ok(text) if !text.is_empty() => Some(text),
                Ok(_) => None,
                Err(err) => {
                    warn!(error = %err, "Format prompt unavailable, using plain output");
                    None
                }
            },
            None => None,
        };
        let sectioned = format_prompt.is_some();

        let model = localization
            .generator_model
            .clone()
            .unwrap_or_else(|| DEFAULT_GENERATOR_MODEL.to_string());
        let api_key = if model.starts_with(GROQ_MODEL_PREFIX) {
            self.org
                .groq
                .as_ref()
                .map(|g| g.api_key.clone())
                .ok_or_else(|| CoreError::Config("Groq model without a Groq API key".into()))?
        } else {
            self.org.openai.api_key.clone()
        };

        let messages = build_messages(
            &system_prompt,
            format_prompt.as_deref(),
            &self.request.chat_history,
            &outcome.correction,
            km_result,
        );

        let mut stream = self
            .deps
            .generator
            .generate(GenerationRequest {
                model,
                messages,
                api_key,
                temperature: DEFAULT_TEMPERATURE,
                max_tokens: DEFAULT_MAX_TOKENS,
            })
            .await?;

        let mut parser = StreamParser::new(sectioned);
        let mut units = Vec::new();
        let mut stream_error: Option<CoreError> = None;
        let mut session_ended = false;

        while !session_ended {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Generation cancelled");
                    return Ok(());
                }
                next = stream.next() => match next {
                    Some(Ok(fragment)) => {
                        parser.push(&fragment, &mut units);
                        session_ended = self.dispatch_units(&mut units).await;
                    }
                    Some(Err(err)) => {
                        stream_error = Some(err);
                        break;
                    }
                    None => break,
                }
            }
        }

        let metadata = parser.finish(&mut units);
        self.dispatch_units(&mut units).await;
        // Metadata lands after the last answer_chunk of its section and
        // before `complete`.
        if let Some(metadata) = metadata {
            self.sink.emit(Event::Metadata(metadata)).await;
        }

        match stream_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Emit parsed units onto the sink and fan spoken text into TTS.
    /// Returns true when the session-end marker was reached.
    async fn dispatch_units(&self, units: &mut Vec<ParsedUnit>) -> bool {
        let mut ended = false;
        for unit in units.drain(..) {
            match unit {
                ParsedUnit::Answer(text) => {
                    self.sink.emit(Event::AnswerChunk(text.clone())).await;
                    if let Some(tts) = &self.tts {
                        tts.add_text_chunk(&text, &self.request.language).await;
                    }
                }
                ParsedUnit::Thinking(text) => {
                    self.sink.emit(Event::Thinking(text)).await;
                }
                ParsedUnit::Formatted(text) => {
                    self.sink.emit(Event::FormattedAnswer(text)).await;
                }
                ParsedUnit::SessionEnd => {
                    self.sink
                        .emit(Event::Status(STATUS_SESSION_ENDED.into()))
                        .await;
                    ended = true;
                }
            }
        }
        ended
    }

    /// Resolve this flow's components. TTS drains in its own task so slow
    /// synthesis does not gate the text producer's completion.
    async fn finalize(&self) {
        if let Some(tts) = &self.tts {
            tts.flush_all().await;
            let tts = tts.clone();
            tokio::spawn(async move { tts.close().await });
        }
        self.sink
            .mark_component_complete(COMPONENT_TEXT_GENERATION)
            .await;
    }

    async fn fatal(&self, err: CoreError) {
        warn!(error = %err, "Fatal pipeline error");
        self.sink.error(&err).await;
        self.sink.close_fatal().await;
        // The stream is gone; still wind the TTS workers down.
        if let Some(tts) = &self.tts {
            let tts = tts.clone();
            tokio::spawn(async move { tts.close().await });
        }
    }
}

/// Assemble the chat messages: system prompt (optionally fused with the
/// two-section format brief), the prior turns, then the current user turn
/// built from the corrected transcript and the retrieved documents.
pub fn build_messages(
    system_prompt: &str,
    format_prompt: Option<&str>,
    chat_history: &[crate::request::ChatTurn],
    correction: &str,
    km_result: &KmSearchResponse,
) -> Vec<PromptMessage> {
    let context = format_documents(km_result);
    let system = match format_prompt {
        Some(format_brief) => format!(
            "You're a professional response generator that needs to provide a response \
             in 2 consecutive sections as follows:\n\n\
             ** Section A:\nProvide your response according to the following brief:\n{system_prompt}\n\
             ====== END OF SECTION A ======\n\
             Section B:\nFormat the response you've just provided in Section A with the following guidelines:\n{format_brief}\n\
             ====== END OF SECTION B ======\n\n\
             {context}\n\n\
             [IMPORTANT] You MUST output the 2 distinct sections strictly with the following formatting:\n\
             <sectionA>\n<Response to section A, ending with [meta:docs]<json> if there are any documents to reference>\n</sectionA>\n\
             <sectionB>\n<Response to section B>\n</sectionB>"
        ),
        None => format!("{system_prompt}\n\n{context}"),
    };

    let mut messages = Vec::with_capacity(chat_history.len() + 2);
    messages.push(PromptMessage::system(system));
    for turn in chat_history {
        messages.push(match turn.role {
            ChatRole::User => PromptMessage::user(turn.content.clone()),
            ChatRole::Assistant => PromptMessage::assistant(turn.content.clone()),
        });
    }
    messages.push(PromptMessage::user(correction.to_string()));
    messages
}

/// Render retrieved documents into prompt context, best-ranked first.
fn format_documents(km_result: &KmSearchResponse) -> String {
    if km_result.data.is_empty() {
        return "=== Knowledge Base Results ===\nNo relevant results found in the knowledge base.".to_string();
    }
    let mut out = String::from("=== Knowledge Base Results ===\n");
    for (i, item) in km_result.data.iter().take(5).enumerate() {
        out.push_str(&format!("\n{}. **Score: {:.3}**\n", i + 1, item.reranker_score));
        if let Some(title) = &item.document.title {
            out.push_str(&format!("Title: {title}\n"));
        }
        out.push_str(&format!("Content: {}\n", item.document.content));
        if let Some(questions) = &item.document.sample_questions {
            out.push_str(&format!("Sample Questions: {questions}\n"));
        }
    }
    out
}
