//! # Server Module
//!
//! Router, middleware stack and shared state for the HTTP surface.

pub mod handlers;
pub mod state;

pub use handlers::{
    cancel_job, chat, create_image, create_video, health_check, image_status, list_jobs,
    video_status,
};
pub use state::AppState;

use axum::{
    http::HeaderValue,
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::{self, TraceLayer},
};
use tracing::{warn, Level};

use crate::config::Config;

/// CORS policy from `cors_origin`: `*` allows everything, otherwise a
/// comma-separated list of exact origins.
pub fn cors_layer(config: &Config) -> CorsLayer {
    if config.cors_origin.trim() == "*" {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .cors_origin
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("ignoring invalid CORS origin '{}'", o);
                None
            }
        })
        .collect();

    if origins.is_empty() {
        warn!("no valid CORS origins configured, allowing any origin");
        return CorsLayer::permissive();
    }

    CorsLayer::permissive().allow_origin(AllowOrigin::list(origins))
}

/// Create router with all routes and middleware
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(state.config());

    Router::new()
        // Chat relay
        .route("/api/chat", post(chat))

        // Generation jobs
        .route("/api/image", post(create_image))
        .route("/api/image/status/{job_id}", get(image_status))
        .route("/api/video", post(create_video))
        .route("/api/video/status/{job_id}", get(video_status))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{job_id}", delete(cancel_job))

        .route("/health", get(health_check))

        .layer(
            ServiceBuilder::new()
                // SSE responses are excluded by the default compression predicate
                .layer(CompressionLayer::new())
                .layer(TraceLayer::new_for_http()
                    .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                    .on_response(trace::DefaultOnResponse::new().level(Level::INFO)))
                .layer(cors),
        )
        .with_state(state)
}
