//! Audio utility endpoints.

pub mod handlers;
mod wav;

use axum::{routing::post, Router};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/audio/trim", post(handlers::trim_audio))
}
