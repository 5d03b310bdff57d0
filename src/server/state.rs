//! # Application State
//!
//! Shared state passed to all HTTP handlers: configuration, the pooled HTTP
//! client and the job registry.

use crate::{
    config::Config,
    core::http_client::{HttpClientBuilder, HttpClientError},
    jobs::JobRegistry,
};

/// # Application State
///
/// Cloned into every handler. The registry and the HTTP client are handles,
/// so clones share the same jobs and connection pool.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Config,
    /// HTTP client for all upstream requests
    pub http_client: reqwest::Client,
    /// Generation jobs
    pub registry: JobRegistry,
}

impl AppState {
    /// Create new application state from configuration
    pub async fn new(config: Config) -> Result<Self, HttpClientError> {
        let http_client = HttpClientBuilder::from_config(&config).build()?;
        let registry = JobRegistry::from_config(&config);
        Ok(Self {
            config,
            http_client,
            registry,
        })
    }

    /// Get a reference to the config
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a reference to the HTTP client
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }
}
