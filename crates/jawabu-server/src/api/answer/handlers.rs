//! Request adapter for `POST /api/v1/answer-sse`.
//!
//! Validates the inbound request, loads the organisation configuration,
//! wires the event sink, TTS streamer and orchestrator together, and bridges
//! the sink's channel into the SSE response. Rejections still answer with a
//! short SSE document (`error` then `complete`) so stream readers never hang.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Extension, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event as SseFrame, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use jawabu_core::events::DEFAULT_QUEUE_DEPTH;
use jawabu_core::tts::{AzureSpeechClient, TtsRenderer, TtsStreamer};
use jawabu_core::{AnswerFlow, AnswerRequest, CoreError, Event, EventSink, SinkMessage};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub async fn answer_sse(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Json(request): Json<AnswerRequest>,
) -> Response {
    if let Err(err) = request.validate() {
        return rejection_stream(StatusCode::BAD_REQUEST, &err);
    }

    let org = match state
        .org_store
        .load(&request.org_id, &request.config_id)
        .await
    {
        Ok(Some(org)) => org,
        Ok(None) => {
            let err = CoreError::BadRequest(format!(
                "Organisation configuration not found: {}/{}",
                request.org_id, request.config_id
            ));
            return rejection_stream(StatusCode::NOT_FOUND, &err);
        }
        Err(err) => {
            warn!(error = %err, "Failed to load organisation configuration");
            return rejection_stream(StatusCode::INTERNAL_SERVER_ERROR, &err);
        }
    };
    info!(
        correlation_id = %context.correlation_id,
        org = %org.display_name,
        language = %request.language,
        "Answer pipeline accepted"
    );

    let (sink, rx) = EventSink::channel(DEFAULT_QUEUE_DEPTH);

    // TTS rides along when the organisation has a voice for this request
    // (directly or through the default-language fallback).
    let tts = org.tts.as_ref().and_then(|tts_config| {
        org.voice_for(&request.language)?;
        let synthesizer = AzureSpeechClient::new(
            state.http.clone(),
            &tts_config.azure.region,
            org.tts_subscription_key().unwrap_or_default(),
        );
        let renderer = TtsRenderer::new(Arc::new(synthesizer), state.audio_cache.clone());
        Some(Arc::new(TtsStreamer::new(
            org.clone(),
            Arc::new(renderer),
            state.phonemes.clone(),
            sink.clone(),
        )))
    });

    let cancel = CancellationToken::new();
    let tts_for_cleanup = tts.clone();
    let flow = AnswerFlow::new(
        request,
        org,
        sink.clone(),
        tts,
        state.deps.clone(),
        cancel.clone(),
    );

    let semaphore = state.request_semaphore.clone();
    let pipeline_timeout = state.config.pipeline_timeout;
    let flow_sink = sink.clone();
    let task_cancel = cancel.clone();
    let correlation_id = context.correlation_id.clone();
    tokio::spawn(async move {
        let _permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                flow_sink
                    .error(&CoreError::Config("Server is shutting down".into()))
                    .await;
                flow_sink.close_fatal().await;
                return;
            }
        };
        tokio::select! {
            // Client disconnect: drop the flow wherever it is blocked, then
            // drain its TTS workers so nothing outlives the request.
            _ = task_cancel.cancelled() => {
                info!(correlation_id = %correlation_id, "Client disconnected, cancelling answer pipeline");
                flow_sink.close_fatal().await;
                if let Some(tts) = tts_for_cleanup {
                    tts.close().await;
                }
            }
            timed = tokio::time::timeout(pipeline_timeout, flow.run()) => {
                if timed.is_err() {
                    warn!(correlation_id = %correlation_id, "Answer pipeline timed out");
                    flow_sink
                        .error(&CoreError::LlmFailed("Answer pipeline timed out".into()))
                        .await;
                    flow_sink.close_fatal().await;
                    if let Some(tts) = tts_for_cleanup {
                        tts.close().await;
                    }
                }
            }
        }
    });

    // Dropping the response body (client disconnect) drops the guard, which
    // cancels the orchestrator and lets every request-scoped task wind down.
    let guard = cancel.drop_guard();
    let stream = sse_frames(rx, guard);
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

fn sse_frames(
    mut rx: tokio::sync::mpsc::Receiver<SinkMessage>,
    guard: tokio_util::sync::DropGuard,
) -> impl Stream<Item = Result<SseFrame, Infallible>> {
    async_stream::stream! {
        let _guard = guard;
        while let Some(message) = rx.recv().await {
            match message {
                SinkMessage::Event(frame) => yield Ok(SseFrame::default().data(frame)),
                SinkMessage::Close => break,
            }
        }
    }
}

/// A rejected request still answers with a well-formed two-event SSE body so
/// clients reading the stream observe `error` then `complete`.
fn rejection_stream(status: StatusCode, err: &CoreError) -> Response {
    let body = format!(
        "data: {}\n\ndata: {}\n\n",
        Event::Error(err.to_string()).to_frame(),
        Event::Complete("Request rejected before pipeline start".into()).to_frame(),
    );
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_body_is_error_then_complete() {
        let response = rejection_stream(
            StatusCode::BAD_REQUEST,
            &CoreError::BadRequest("transcript is required".into()),
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
    }
}
