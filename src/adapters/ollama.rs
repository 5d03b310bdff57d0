//! # Ollama Adapter
//!
//! Streams `POST {base}/api/chat`. Ollama answers with NDJSON: one JSON object
//! per line, the fragment under `message.content`, and `done: true` on the
//! last record.

use reqwest::{Client, Response};
use serde_json::json;
use std::time::Duration;

use super::{open, ChatTarget};
use crate::error::ProxyError;
use crate::schemas::Message;
use crate::streaming::UpstreamFraming;

/// # Ollama Adapter
#[derive(Clone, Debug)]
pub struct OllamaAdapter {
    target: ChatTarget,
    client: Client,
}

impl OllamaAdapter {
    pub fn new(target: ChatTarget, client: Client) -> Self {
        Self { target, client }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/chat", self.target.base)
    }

    pub fn target(&self) -> &ChatTarget {
        &self.target
    }

    pub fn framing(&self) -> UpstreamFraming {
        UpstreamFraming::NdJson
    }

    pub async fn open_stream(&self, messages: &[Message], timeout: Duration) -> Result<Response, ProxyError> {
        let upstream: Vec<_> = messages.iter().map(Message::upstream).collect();
        let body = json!({
            "model": self.target.model,
            "messages": upstream,
            "stream": true,
        });
        open(&self.client, "Ollama", &self.target, &self.endpoint(), &body, timeout).await
    }
}
