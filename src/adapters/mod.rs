//! # Chat Adapters Module
//!
//! Opens the streaming chat request against the configured backend and tells
//! the relay how that backend frames its stream.
//!
//! ## Supported Backends:
//!
//! - **Ollama**: `/api/chat`, NDJSON
//! - **OpenAI-compatible**: `/v1/chat/completions`, SSE (vLLM and similar)

use reqwest::{Client, Response};
use serde_json::Value;
use std::borrow::Cow;
use std::time::Duration;
use tracing::debug;

use crate::config::{Config, Upstream};
use crate::error::ProxyError;
use crate::schemas::{Message, Role};
use crate::streaming::UpstreamFraming;

pub mod ollama;
pub mod openai;

pub use ollama::OllamaAdapter;
pub use openai::OpenAIAdapter;

/// Resolved chat backend settings shared by both adapters.
#[derive(Clone, Debug)]
pub struct ChatTarget {
    /// Base URL without a trailing slash
    pub base: String,
    pub model: String,
    /// Optional bearer token
    pub api_key: Option<String>,
}

impl ChatTarget {
    pub fn new(base: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base: base.into(),
            model: model.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }
}

/// Send the streaming request and classify failures before any byte is relayed.
pub(crate) async fn open(
    client: &Client,
    backend: &str,
    target: &ChatTarget,
    url: &str,
    body: &Value,
    timeout: Duration,
) -> Result<Response, ProxyError> {
    let mut request = client.post(url).json(body).timeout(timeout);
    if let Some(key) = &target.api_key {
        request = request.bearer_auth(key);
    }

    debug!(backend, url, model = %target.model, "opening chat stream");
    let response = request
        .send()
        .await
        .map_err(|e| ProxyError::from_transport(backend, &target.base, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProxyError::from_status(backend, status.as_u16(), &body));
    }
    Ok(response)
}

/// # Chat Adapter
#[derive(Clone, Debug)]
pub enum ChatAdapter {
    Ollama(OllamaAdapter),
    OpenAI(OpenAIAdapter),
}

impl ChatAdapter {
    /// Build the adapter named by `llm_backend`.
    ///
    /// URL problems surface here as configuration errors, before any request
    /// is sent.
    pub fn from_config(config: &Config, client: Client) -> Result<Self, ProxyError> {
        let base = config.upstream_url(Upstream::Chat)?;
        let target = ChatTarget::new(base, config.llm_model_name.clone(), config.llm_api_key.clone());
        match config.llm_backend.as_str() {
            "openai" => Ok(Self::OpenAI(OpenAIAdapter::new(target, client))),
            "ollama" => Ok(Self::Ollama(OllamaAdapter::new(target, client))),
            other => Err(ProxyError::configuration(
                format!("Unknown LLM backend '{}'", other),
                "Set LLM_BACKEND to 'ollama' or 'openai'.",
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ollama(_) => "ollama",
            Self::OpenAI(_) => "openai",
        }
    }

    pub fn target(&self) -> &ChatTarget {
        match self {
            Self::Ollama(adapter) => adapter.target(),
            Self::OpenAI(adapter) => adapter.target(),
        }
    }

    pub fn model(&self) -> &str {
        &self.target().model
    }

    pub fn framing(&self) -> UpstreamFraming {
        match self {
            Self::Ollama(adapter) => adapter.framing(),
            Self::OpenAI(adapter) => adapter.framing(),
        }
    }

    /// Open the upstream stream for `messages`.
    pub async fn open_stream(&self, messages: &[Message], timeout: Duration) -> Result<Response, ProxyError> {
        match self {
            Self::Ollama(adapter) => adapter.open_stream(messages, timeout).await,
            Self::OpenAI(adapter) => adapter.open_stream(messages, timeout).await,
        }
    }
}

/// Prepend `system_prompt` unless the conversation already has a system message.
pub fn with_system_prompt<'a>(messages: &'a [Message], system_prompt: Option<&str>) -> Cow<'a, [Message]> {
    match system_prompt.map(str::trim).filter(|p| !p.is_empty()) {
        Some(prompt) if !messages.iter().any(|m| m.role == Role::System) => {
            let mut full = Vec::with_capacity(messages.len() + 1);
            full.push(Message::new(Role::System, prompt));
            full.extend_from_slice(messages);
            Cow::Owned(full)
        }
        _ => Cow::Borrowed(messages),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::http_client::HttpClientBuilder;

    fn client() -> Client {
        HttpClientBuilder::new().build().unwrap()
    }

    #[test]
    fn test_backend_selection() {
        let mut config = Config::for_test();
        let adapter = ChatAdapter::from_config(&config, client()).unwrap();
        assert_eq!(adapter.name(), "ollama");
        assert_eq!(adapter.framing(), UpstreamFraming::NdJson);

        config.llm_backend = "openai".to_string();
        config.llm_api_url = Some("http://gpu-box:8000/".to_string());
        let adapter = ChatAdapter::from_config(&config, client()).unwrap();
        assert_eq!(adapter.name(), "openai");
        assert_eq!(adapter.framing(), UpstreamFraming::Sse);
        assert_eq!(adapter.target().base, "http://gpu-box:8000");
    }

    #[test]
    fn test_misconfiguration_is_reported_before_network() {
        let mut config = Config::for_test();
        config.environment = "production".to_string();
        config.llm_api_url = None;
        let err = ChatAdapter::from_config(&config, client()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_system_prompt_prepended_once() {
        let messages = vec![Message::new(Role::User, "hi")];
        let full = with_system_prompt(&messages, Some("You are Kepler."));
        assert_eq!(full.len(), 2);
        assert_eq!(full[0].role, Role::System);

        let again = with_system_prompt(&full, Some("You are Kepler."));
        assert!(matches!(again, Cow::Borrowed(_)));
        assert!(matches!(with_system_prompt(&messages, None), Cow::Borrowed(_)));
    }

    #[test]
    fn test_blank_api_key_ignored() {
        let target = ChatTarget::new("http://x", "m", Some("  ".to_string()));
        assert!(target.api_key.is_none());
    }
}
