//! The streaming answer endpoint.

pub mod handlers;

use axum::{routing::post, Router};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/answer-sse", post(handlers::answer_sse))
}
