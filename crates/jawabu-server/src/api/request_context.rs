//! Per-request context: correlation id, tracing span, and latency log.
//!
//! Every request runs inside an `answer_request` span carrying the
//! correlation id, so pipeline logs (orchestrator stages, TTS workers,
//! cache traffic) correlate across tasks. Callers may supply their own id
//! via `x-request-id`; otherwise one is minted, and either way the id is
//! echoed on the response.

use std::time::Instant;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone, Debug)]
pub struct RequestContext {
    pub correlation_id: String,
}

/// Resolve the correlation id, run the request inside its span, and log the
/// outcome with wall-clock latency.
pub async fn attach_request_context(mut req: Request, next: Next) -> Response {
    let started = Instant::now();
    let correlation_id = correlation_id_from(&req);

    let span = info_span!(
        "answer_request",
        correlation_id = %correlation_id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    req.extensions_mut().insert(RequestContext {
        correlation_id: correlation_id.clone(),
    });

    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    info!(
        correlation_id = %correlation_id,
        status = %response.status(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request finished"
    );
    response
}

fn correlation_id_from(req: &Request) -> String {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req-{}", Uuid::new_v4().simple()))
}
