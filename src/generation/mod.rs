//! # Generation Backends
//!
//! Clients for the image and video generation servers. Each backend knows how
//! to start a job, how to ask about its progress, and (through its
//! [`ResultLocator`]) where the finished artifact lives. The poll loop in
//! [`crate::jobs`] only sees this trait.
//!
//! ## Supported Backends:
//!
//! - **ComfyUI**: text-to-image workflow, tracked by `prompt_id`
//! - **CogVideo**: text-to-video server, tracked by `task_id`

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::ProxyError;
use crate::jobs::JobKind;

pub mod cogvideo;
pub mod comfyui;

pub use cogvideo::{CogVideoBackend, CogVideoLocator};
pub use comfyui::{ComfyImageLocator, ComfyUiBackend};

/// Timeout for the liveness probe sent before a submission.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);
/// Timeout for the "start generation" request.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend-specific generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationParams {
    Image {
        width: u32,
        height: u32,
        negative_prompt: Option<String>,
    },
    Video {
        frames: u32,
    },
}

/// # Generation Request
///
/// Validated input for one job, independent of the HTTP body it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn image(prompt: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            prompt: prompt.into(),
            params: GenerationParams::Image {
                width,
                height,
                negative_prompt: None,
            },
        }
    }

    pub fn video(prompt: impl Into<String>, frames: u32) -> Self {
        Self {
            prompt: prompt.into(),
            params: GenerationParams::Video { frames },
        }
    }

    pub fn kind(&self) -> JobKind {
        match self.params {
            GenerationParams::Image { .. } => JobKind::Image,
            GenerationParams::Video { .. } => JobKind::Video,
        }
    }
}

/// What one status query learned about an upstream job.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamStatus {
    /// Queued or running.
    Running,
    /// Finished; carries the backend's declared outputs for the locator.
    Succeeded(Value),
    /// The backend reported a failure.
    Failed(String),
}

/// Finds the retrievable artifact URL in a backend's declared outputs.
pub trait ResultLocator: Send + Sync {
    fn locate(&self, outputs: &Value) -> Option<String>;
}

/// # Generation Backend
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Human-readable name used in logs and error messages.
    fn name(&self) -> &'static str;

    fn kind(&self) -> JobKind;

    /// Start a generation and return the upstream tracking handle.
    async fn submit(&self, request: &GenerationRequest) -> Result<String, ProxyError>;

    /// Query the upstream for the status of `handle`.
    async fn check(&self, handle: &str) -> Result<UpstreamStatus, ProxyError>;

    fn locator(&self) -> &dyn ResultLocator;
}

/// Send `request` and decode a JSON body, classifying every failure.
///
/// Transport errors become connection errors; non-2xx answers keep their
/// status and a body excerpt.
pub(crate) async fn send_json(
    backend: &str,
    url: &str,
    request: RequestBuilder,
) -> Result<Value, ProxyError> {
    let response = request
        .send()
        .await
        .map_err(|e| ProxyError::from_transport(backend, url, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        debug!(backend, url, status = status.as_u16(), "upstream returned an error status");
        return Err(ProxyError::from_status(backend, status.as_u16(), &body));
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| ProxyError::Upstream(format!("{} returned invalid JSON: {}", backend, e)))
}

/// GET `url` with `timeout`, only caring whether the backend answers 2xx.
pub(crate) async fn probe(
    client: &Client,
    backend: &str,
    url: &str,
    timeout: Duration,
) -> Result<(), ProxyError> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| ProxyError::from_transport(backend, url, e))?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(ProxyError::Unreachable {
            backend: backend.to_string(),
            url: url.to_string(),
            message: format!(
                "{} at {} is not responding (status {}). Please make sure it has finished starting.",
                backend,
                url,
                response.status().as_u16()
            ),
        })
    }
}
