//! # ComfyUI Backend
//!
//! Submits a fixed text-to-image workflow to ComfyUI's `/prompt` endpoint and
//! tracks it by the returned `prompt_id`. Progress comes from `/queue` while
//! the prompt is queued or running, then from `/history/{prompt_id}`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    probe, send_json, GenerationBackend, GenerationParams, GenerationRequest, ResultLocator,
    UpstreamStatus, HEALTH_TIMEOUT, SUBMIT_TIMEOUT,
};
use crate::config::{Config, Upstream};
use crate::error::ProxyError;
use crate::jobs::JobKind;

const BACKEND: &str = "ComfyUI";
const DEFAULT_NEGATIVE_PROMPT: &str = "text, watermark, blurry, low quality";

/// Builds `/view` URLs for images listed in a history entry's outputs.
#[derive(Debug, Clone)]
pub struct ComfyImageLocator {
    base: String,
}

impl ComfyImageLocator {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }
}

impl ResultLocator for ComfyImageLocator {
    /// First output node with a non-empty `images` array. Node ids are
    /// visited in numeric order; non-numeric ids come last.
    fn locate(&self, outputs: &Value) -> Option<String> {
        let mut nodes: Vec<(&String, &Value)> = outputs.as_object()?.iter().collect();
        nodes.sort_by_key(|(id, _)| id.parse::<u64>().unwrap_or(u64::MAX));

        let image = nodes.into_iter().find_map(|(_, node)| {
            node.get("images")
                .and_then(Value::as_array)
                .and_then(|images| images.first())
        })?;

        let filename = image.get("filename").and_then(Value::as_str)?;
        if filename.is_empty() {
            return None;
        }
        let subfolder = image.get("subfolder").and_then(Value::as_str).unwrap_or("");
        let kind = image
            .get("type")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .unwrap_or("output");

        let mut url = Url::parse(&format!("{}/view", self.base)).ok()?;
        url.query_pairs_mut()
            .append_pair("filename", filename)
            .append_pair("subfolder", subfolder)
            .append_pair("type", kind);
        Some(url.to_string())
    }
}

/// # ComfyUI Backend
#[derive(Debug, Clone)]
pub struct ComfyUiBackend {
    base: String,
    checkpoint: String,
    client: Client,
    poll_timeout: Duration,
    locator: ComfyImageLocator,
}

impl ComfyUiBackend {
    pub fn new(base: impl Into<String>, checkpoint: impl Into<String>, client: Client) -> Self {
        let base = base.into();
        Self {
            locator: ComfyImageLocator::new(base.clone()),
            base,
            checkpoint: checkpoint.into(),
            client,
            poll_timeout: Duration::from_secs(30),
        }
    }

    /// Resolve the ComfyUI URL from configuration. Fails without touching the network.
    pub fn from_config(config: &Config, client: Client) -> Result<Self, ProxyError> {
        let base = config.upstream_url(Upstream::Image)?;
        let mut backend = Self::new(base, config.comfyui_checkpoint.clone(), client);
        backend.poll_timeout = Duration::from_secs(config.http_client_timeout);
        Ok(backend)
    }


    /// The text-to-image graph: checkpoint → prompts → empty latent → KSampler → VAE decode → save.
    pub fn workflow(&self, prompt: &str, width: u32, height: u32, negative: &str) -> Value {
        let seed = fastrand::u64(..10_000_000_000);
        json!({
            "3": {
                "class_type": "KSampler",
                "inputs": {
                    "seed": seed,
                    "steps": 20,
                    "cfg": 8,
                    "sampler_name": "euler",
                    "scheduler": "normal",
                    "denoise": 1,
                    "model": ["4", 0],
                    "positive": ["6", 0],
                    "negative": ["7", 0],
                    "latent_image": ["5", 0]
                }
            },
            "4": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": self.checkpoint }
            },
            "5": {
                "class_type": "EmptyLatentImage",
                "inputs": { "width": width, "height": height, "batch_size": 1 }
            },
            "6": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": prompt, "clip": ["4", 1] }
            },
            "7": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": negative, "clip": ["4", 1] }
            },
            "8": {
                "class_type": "VAEDecode",
                "inputs": { "samples": ["3", 0], "vae": ["4", 2] }
            },
            "9": {
                "class_type": "SaveImage",
                "inputs": { "filename_prefix": "ComfyUI", "images": ["8", 0] }
            }
        })
    }

    fn not_running(&self, err: ProxyError) -> ProxyError {
        match err {
            ProxyError::Unreachable { url, message, .. } if message.contains("timeout") => {
                ProxyError::Unreachable {
                    backend: BACKEND.to_string(),
                    message: format!(
                        "ComfyUI connection timeout. Please check that ComfyUI is running and responsive at {}",
                        self.base
                    ),
                    url,
                }
            }
            ProxyError::Unreachable { url, .. } => ProxyError::Unreachable {
                backend: BACKEND.to_string(),
                message: format!(
                    "ComfyUI is not running at {}. Please start the generation services and try again.",
                    self.base
                ),
                url,
            },
            other => other,
        }
    }

    async fn in_queue(&self, prompt_id: &str) -> Result<bool, ProxyError> {
        let url = format!("{}/queue", self.base);
        let queue = send_json(BACKEND, &url, self.client.get(&url).timeout(self.poll_timeout)).await?;

        let listed = |key: &str| {
            queue
                .get(key)
                .and_then(Value::as_array)
                .map(|entries| {
                    entries
                        .iter()
                        .any(|entry| entry.get(1).and_then(Value::as_str) == Some(prompt_id))
                })
                .unwrap_or(false)
        };
        Ok(listed("queue_running") || listed("queue_pending"))
    }
}

/// Pull the `prompt_id` out of a `/prompt` response, which is usually an
/// object but has been seen wrapped in a one-element array.
fn extract_prompt_id(data: &Value) -> Option<String> {
    data.get("prompt_id")
        .or_else(|| data.get(0).and_then(|first| first.get("prompt_id")))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl GenerationBackend for ComfyUiBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn kind(&self) -> JobKind {
        JobKind::Image
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<String, ProxyError> {
        let GenerationParams::Image {
            width,
            height,
            negative_prompt,
        } = &request.params
        else {
            return Err(ProxyError::BadRequest(
                "ComfyUI only accepts image requests".to_string(),
            ));
        };

        let health = format!("{}/system_stats", self.base);
        probe(&self.client, BACKEND, &health, HEALTH_TIMEOUT)
            .await
            .map_err(|e| self.not_running(e))?;

        let negative = negative_prompt
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(DEFAULT_NEGATIVE_PROMPT);
        let workflow = self.workflow(&request.prompt, *width, *height, negative);

        let url = format!("{}/prompt", self.base);
        let data = send_json(
            BACKEND,
            &url,
            self.client
                .post(&url)
                .json(&json!({ "prompt": workflow }))
                .timeout(SUBMIT_TIMEOUT),
        )
        .await
        .map_err(|e| self.not_running(e))?;

        let prompt_id = extract_prompt_id(&data).ok_or_else(|| {
            warn!(response = %data, "ComfyUI response carried no prompt_id");
            ProxyError::Upstream("ComfyUI did not return a prompt_id".to_string())
        })?;

        info!(prompt_id = %prompt_id, width, height, "ComfyUI prompt queued");
        Ok(prompt_id)
    }

    async fn check(&self, prompt_id: &str) -> Result<UpstreamStatus, ProxyError> {
        if self.in_queue(prompt_id).await? {
            debug!(prompt_id, "ComfyUI prompt still queued");
            return Ok(UpstreamStatus::Running);
        }

        let url = format!("{}/history/{}", self.base, prompt_id);
        let history = send_json(BACKEND, &url, self.client.get(&url).timeout(self.poll_timeout)).await?;

        let Some(entry) = history.get(prompt_id) else {
            // Left the queue but not yet written to history.
            return Ok(UpstreamStatus::Running);
        };

        let status = entry.get("status");
        if status.and_then(|s| s.get("status_str")).and_then(Value::as_str) == Some("error") {
            let message = status
                .and_then(|s| s.get("messages"))
                .and_then(Value::as_array)
                .and_then(|messages| {
                    messages
                        .iter()
                        .filter(|m| m.get(0).and_then(Value::as_str) == Some("execution_error"))
                        .find_map(|m| {
                            m.get(1)
                                .and_then(|detail| detail.get("exception_message"))
                                .and_then(Value::as_str)
                        })
                })
                .unwrap_or("ComfyUI reported an execution error");
            return Ok(UpstreamStatus::Failed(message.trim().to_string()));
        }

        Ok(UpstreamStatus::Succeeded(
            entry.get("outputs").cloned().unwrap_or(Value::Null),
        ))
    }

    fn locator(&self) -> &dyn ResultLocator {
        &self.locator
    }
}
