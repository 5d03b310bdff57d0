//! # CogVideo Backend
//!
//! Text-to-video through the CogVideo server's `/generate` and
//! `/status/{task_id}` endpoints. Finished videos are served by the gateway's
//! host under a configurable path prefix.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

use super::{
    send_json, GenerationBackend, GenerationParams, GenerationRequest, ResultLocator,
    UpstreamStatus, SUBMIT_TIMEOUT,
};
use crate::config::{Config, Upstream};
use crate::error::ProxyError;
use crate::jobs::JobKind;

const BACKEND: &str = "CogVideo";

/// Maps a completed task's `video_path` under the public video prefix.
#[derive(Debug, Clone)]
pub struct CogVideoLocator {
    prefix: String,
}

impl CogVideoLocator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }
}

impl ResultLocator for CogVideoLocator {
    fn locate(&self, outputs: &Value) -> Option<String> {
        let path = outputs
            .get("video_path")
            .and_then(Value::as_str)
            .map(|p| p.trim_start_matches('/'))
            .filter(|p| !p.is_empty())?;
        Some(format!("{}/{}", self.prefix, path))
    }
}

/// # CogVideo Backend
#[derive(Debug, Clone)]
pub struct CogVideoBackend {
    base: String,
    client: Client,
    poll_timeout: Duration,
    locator: CogVideoLocator,
}

impl CogVideoBackend {
    pub fn new(base: impl Into<String>, video_prefix: impl Into<String>, client: Client) -> Self {
        Self {
            base: base.into(),
            client,
            poll_timeout: Duration::from_secs(30),
            locator: CogVideoLocator::new(video_prefix),
        }
    }

    /// Resolve the CogVideo URL from configuration. Fails without touching the network.
    pub fn from_config(config: &Config, client: Client) -> Result<Self, ProxyError> {
        let base = config.upstream_url(Upstream::Video)?;
        let mut backend = Self::new(base, config.video_url_prefix.clone(), client);
        backend.poll_timeout = Duration::from_secs(config.http_client_timeout);
        Ok(backend)
    }

}

#[async_trait]
impl GenerationBackend for CogVideoBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn kind(&self) -> JobKind {
        JobKind::Video
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<String, ProxyError> {
        let GenerationParams::Video { frames } = request.params else {
            return Err(ProxyError::BadRequest(
                "CogVideo only accepts video requests".to_string(),
            ));
        };

        let url = format!("{}/generate", self.base);
        let body = json!({
            "prompt": request.prompt,
            "num_frames": frames,
            "resolution": "256x256",
            "low_resource": true,
        });
        let data = send_json(
            BACKEND,
            &url,
            self.client.post(&url).json(&body).timeout(SUBMIT_TIMEOUT),
        )
        .await
        .map_err(|err| match err {
            ProxyError::Unreachable { url, message, .. } if !message.contains("timeout") => {
                ProxyError::Unreachable {
                    backend: BACKEND.to_string(),
                    message: format!(
                        "CogVideo is not running at {}. Please start the generation services and try again.",
                        self.base
                    ),
                    url,
                }
            }
            other => other,
        })?;

        let task_id = match data.get("task_id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(ProxyError::Upstream(
                    "CogVideo did not return a task_id".to_string(),
                ))
            }
        };

        info!(task_id = %task_id, frames, "CogVideo task started");
        Ok(task_id)
    }

    async fn check(&self, task_id: &str) -> Result<UpstreamStatus, ProxyError> {
        let url = format!("{}/status/{}", self.base, task_id);
        let status = send_json(BACKEND, &url, self.client.get(&url).timeout(self.poll_timeout)).await?;

        match status.get("status").and_then(Value::as_str) {
            Some("completed") => Ok(UpstreamStatus::Succeeded(status)),
            Some("failed") => Ok(UpstreamStatus::Failed(
                status
                    .get("error")
                    .and_then(Value::as_str)
                    .filter(|e| !e.is_empty())
                    .unwrap_or("Video generation failed")
                    .to_string(),
            )),
            _ => Ok(UpstreamStatus::Running),
        }
    }

    fn locator(&self) -> &dyn ResultLocator {
        &self.locator
    }
}
