//! # Kepler Gateway
//!
//! HTTP gateway between a browser chat UI and locally hosted AI servers.
//!
//! ## Features
//!
//! - **Chat relay**: streams Ollama NDJSON or OpenAI-compatible SSE back to the
//!   browser as one normalized Server-Sent Events format
//! - **Generation jobs**: image (ComfyUI) and video (CogVideo) requests become
//!   jobs that are submitted, polled in supervised background tasks and
//!   queried by id
//! - **Actionable errors**: configuration, connectivity and upstream failures
//!   are reported separately, with the URL that was tried
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kepler_gateway::{create_router, AppState, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::for_test(); // or Config::parse_args() for CLI
//!     let state = AppState::new(config).await?;
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`config`] - Configuration management with CLI and environment support
//! - [`adapters`] - Chat backends (Ollama, OpenAI-compatible)
//! - [`streaming`] - Stream relay and SSE framing
//! - [`generation`] - Image and video generation backends
//! - [`jobs`] - Job registry and poller
//! - [`schemas`] - Request/response data structures
//! - [`error`] - Error categories and HTTP mapping

// Core infrastructure
pub mod core;
pub mod config;
pub mod error;
pub mod schemas;
pub mod graceful_shutdown;

// Domain modules
pub mod adapters;
pub mod generation;
pub mod jobs;
pub mod streaming;

#[cfg(feature = "server")]
pub mod server;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::ProxyError;
pub use adapters::{ChatAdapter, OllamaAdapter, OpenAIAdapter};
pub use generation::{CogVideoBackend, ComfyUiBackend, GenerationBackend, GenerationRequest};
pub use jobs::{Job, JobKind, JobRegistry, JobRunner, JobStatus, PollPolicy};
pub use schemas::Message;
pub use core::http_client::{HttpClientBuilder, HttpClientConfig};
pub use graceful_shutdown::{GracefulShutdown, ShutdownConfig};

// Server re-exports (feature-gated)
#[cfg(feature = "server")]
pub use server::{create_router, AppState};
