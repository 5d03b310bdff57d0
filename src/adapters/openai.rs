//! # OpenAI-Compatible Adapter
//!
//! Streams `POST {base}/v1/chat/completions` on servers that speak the OpenAI
//! chat API (vLLM and friends). The upstream already emits SSE, so events are
//! relayed unchanged.

use reqwest::{Client, Response};
use serde_json::json;
use std::time::Duration;

use super::{open, ChatTarget};
use crate::error::ProxyError;
use crate::schemas::Message;
use crate::streaming::UpstreamFraming;

const TEMPERATURE: f32 = 0.7;

/// # OpenAI Adapter
#[derive(Clone, Debug)]
pub struct OpenAIAdapter {
    target: ChatTarget,
    client: Client,
}

impl OpenAIAdapter {
    pub fn new(target: ChatTarget, client: Client) -> Self {
        Self { target, client }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.target.base)
    }

    pub fn target(&self) -> &ChatTarget {
        &self.target
    }

    pub fn framing(&self) -> UpstreamFraming {
        UpstreamFraming::Sse
    }

    pub async fn open_stream(&self, messages: &[Message], timeout: Duration) -> Result<Response, ProxyError> {
        let upstream: Vec<_> = messages.iter().map(Message::upstream).collect();
        let body = json!({
            "model": self.target.model,
            "messages": upstream,
            "stream": true,
            "temperature": TEMPERATURE,
        });
        open(&self.client, "OpenAI-compatible server", &self.target, &self.endpoint(), &body, timeout).await
    }
}
