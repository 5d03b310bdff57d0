//! # Request and Response Schemas
//!
//! Wire types shared by the HTTP handlers, the stream relay and the
//! generation backends. Client-facing JSON uses camelCase to match the
//! browser UI; upstream-facing JSON follows each backend's own naming.

use serde::{Deserialize, Serialize};

use crate::jobs::{Job, JobKind, JobStatus};

/// # Chat Role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// # Media Kind
///
/// What a rendered message displays. Text is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Text,
    Image,
    Video,
}

/// # Conversation Message
///
/// A message as the UI session holds it. Only `role` and `content` are
/// forwarded to the chat backend; the media and job-reference fields let the
/// UI send its history back verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_type: Option<JobKind>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            media: None,
            image_url: None,
            video_url: None,
            generation_job_id: None,
            generation_type: None,
        }
    }

    /// The subset of the message a chat backend understands.
    pub fn upstream(&self) -> UpstreamMessage<'_> {
        UpstreamMessage {
            role: self.role,
            content: &self.content,
        }
    }
}

/// Role and content only, borrowed from a [`Message`].
#[derive(Debug, Serialize)]
pub struct UpstreamMessage<'a> {
    pub role: Role,
    pub content: &'a str,
}

/// # Stream Chunk
///
/// One normalized unit of incremental output, serialized as the payload of a
/// single SSE `data:` line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: StreamDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// # Ollama Stream Record
///
/// One line of Ollama's `/api/chat` NDJSON stream. Only the fields the relay
/// needs are modelled; everything else is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NdjsonRecord {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub message: Option<NdjsonMessage>,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NdjsonMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// # Image Generation Request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
}

/// # Video Generation Request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub frames: Option<u32>,
}

/// Returned as soon as a generation job is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: String,
}

/// # Job Status Response
///
/// Status endpoint body. The URL field name follows the job kind
/// (`imageUrl` or `videoUrl`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Job> for JobStatusResponse {
    fn from(job: &Job) -> Self {
        let (image_url, video_url) = match job.kind {
            JobKind::Image => (job.result_url.clone(), None),
            JobKind::Video => (None, job.result_url.clone()),
        };
        Self {
            status: job.status,
            image_url,
            video_url,
            error: job.error.clone(),
        }
    }
}
