//! # Server Handlers
//!
//! HTTP route handlers for chat relay, generation jobs and health.

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::AppState;
use crate::{
    adapters::{with_system_prompt, ChatAdapter},
    error::ProxyError,
    generation::{
        CogVideoBackend, ComfyUiBackend, GenerationBackend, GenerationParams, GenerationRequest,
    },
    jobs::{JobKind, JobRunner, PollPolicy},
    schemas::{ImageRequest, JobAccepted, JobStatusResponse, Message, VideoRequest},
    streaming::relay,
};

const DEFAULT_IMAGE_SIZE: u32 = 512;
const MAX_IMAGE_SIZE: u32 = 2048;
const DEFAULT_VIDEO_FRAMES: u32 = 8;

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ProxyError> {
    serde_json::from_slice(body)
        .map_err(|e| ProxyError::BadRequest(format!("Invalid JSON body: {}", e)))
}

fn required_prompt(prompt: Option<String>) -> Result<String, ProxyError> {
    prompt
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ProxyError::BadRequest("Prompt is required".to_string()))
}

/// Chat relay handler
///
/// Body: `{"messages": [{"role", "content"}, ...]}`. Answers with an SSE
/// stream; errors before the first byte are plain JSON error responses.
pub async fn chat(State(state): State<AppState>, body: Bytes) -> Result<Response, ProxyError> {
    let payload: Value = parse_body(&body)?;
    let messages = match payload.get("messages") {
        Some(Value::Array(items)) => items.clone(),
        _ => return Err(ProxyError::BadRequest("Messages array is required".to_string())),
    };
    let messages: Vec<Message> = serde_json::from_value(Value::Array(messages))
        .map_err(|e| ProxyError::BadRequest(format!("Invalid message: {}", e)))?;

    let config = state.config();
    let adapter = ChatAdapter::from_config(config, state.http_client().clone())?;
    let conversation = with_system_prompt(&messages, config.system_prompt.as_deref());

    info!(
        backend = adapter.name(),
        model = adapter.model(),
        messages = conversation.len(),
        "relaying chat stream"
    );

    let upstream = adapter
        .open_stream(&conversation, Duration::from_secs(config.streaming_timeout))
        .await?;

    let frames = relay(
        Box::pin(upstream.bytes_stream()),
        adapter.framing(),
        adapter.model().to_string(),
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(frames))
        .map_err(|e| ProxyError::Internal(format!("Failed to build response: {}", e)))
}

async fn start_job(
    state: &AppState,
    backend: Arc<dyn GenerationBackend>,
    request: GenerationRequest,
) -> Result<Response, ProxyError> {
    let kind = backend.kind();
    let policy = PollPolicy::for_kind(state.config(), kind);
    let runner = JobRunner::new(state.registry().clone(), backend, policy);

    let job_id = runner.start(request).await?;
    info!(job_id = %job_id, budget = ?policy.budget(), "{} job accepted", kind);
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })).into_response())
}

/// Image generation handler
pub async fn create_image(State(state): State<AppState>, body: Bytes) -> Result<Response, ProxyError> {
    let req: ImageRequest = parse_body(&body)?;
    let prompt = required_prompt(req.prompt)?;

    let width = req.width.unwrap_or(DEFAULT_IMAGE_SIZE);
    let height = req.height.unwrap_or(DEFAULT_IMAGE_SIZE);
    for (name, value) in [("width", width), ("height", height)] {
        if value == 0 || value > MAX_IMAGE_SIZE {
            return Err(ProxyError::BadRequest(format!(
                "{} must be between 1 and {}",
                name, MAX_IMAGE_SIZE
            )));
        }
    }

    let backend = ComfyUiBackend::from_config(state.config(), state.http_client().clone())?;
    let request = GenerationRequest {
        prompt,
        params: GenerationParams::Image {
            width,
            height,
            negative_prompt: req.negative_prompt,
        },
    };
    start_job(&state, Arc::new(backend), request).await
}

/// Video generation handler
pub async fn create_video(State(state): State<AppState>, body: Bytes) -> Result<Response, ProxyError> {
    let req: VideoRequest = parse_body(&body)?;
    let prompt = required_prompt(req.prompt)?;

    let frames = req
        .frames
        .filter(|f| *f > 0)
        .unwrap_or(DEFAULT_VIDEO_FRAMES)
        .min(state.config().max_video_frames);

    let backend = CogVideoBackend::from_config(state.config(), state.http_client().clone())?;
    start_job(&state, Arc::new(backend), GenerationRequest::video(prompt, frames)).await
}

fn job_status(state: &AppState, kind: JobKind, job_id: &str) -> Result<Json<JobStatusResponse>, ProxyError> {
    state
        .registry()
        .get(job_id)
        .filter(|job| job.kind == kind)
        .map(|job| Json(JobStatusResponse::from(&job)))
        .ok_or_else(|| ProxyError::NotFound(format!("Job {} not found", job_id)))
}

/// Image job status handler
pub async fn image_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ProxyError> {
    job_status(&state, JobKind::Image, &job_id)
}

/// Video job status handler
pub async fn video_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ProxyError> {
    job_status(&state, JobKind::Video, &job_id)
}

/// List every tracked job
pub async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.registry();
    Json(json!({
        "jobs": registry.list(),
        "counts": registry.counts(),
    }))
}

/// Cancel a job that has not finished
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ProxyError> {
    let job = state.registry().cancel(&job_id)?;
    Ok(Json(JobStatusResponse::from(&job)))
}

/// Health check handler
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.registry();
    let status = if registry.is_shutting_down() { "shutting_down" } else { "healthy" };
    let health_status = json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "kepler-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "jobs": registry.counts(),
    });

    (StatusCode::OK, Json(health_status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_prompt() {
        assert_eq!(required_prompt(Some("  a cat ".into())).unwrap(), "a cat");
        assert!(required_prompt(Some("   ".into())).is_err());
        assert!(required_prompt(None).is_err());
    }

    #[test]
    fn test_parse_body_rejects_garbage() {
        let err = parse_body::<ImageRequest>(&Bytes::from_static(b"not json")).unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }
}
