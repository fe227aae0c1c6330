use axum::http::HeaderValue;
use axum::{middleware, Router};
use jawabu_core::AppConfig;
use tower_http::cors::{Any, CorsLayer};

use crate::api::request_context::attach_request_context;
use crate::state::AppState;

/// Create the main API router. Request spans and latency logging live in the
/// request-context middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    let v1_routes = Router::new()
        .merge(crate::api::answer::router())
        .merge(crate::api::audio::router());

    Router::new()
        .merge(crate::api::internal::router())
        .nest("/api/v1", v1_routes)
        .layer(middleware::from_fn(attach_request_context))
        .layer(cors)
        .with_state(state)
}

/// CORS policy from the configured origin list; a `*` entry opens it up.
fn cors_layer(config: &AppConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.cors_origins.iter().any(|origin| origin == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        layer.allow_origin(origins)
    }
}
