//! # Core Infrastructure
//!
//! Shared plumbing used by every upstream integration.

pub mod http_client;

pub use http_client::{HttpClientBuilder, HttpClientConfig, HttpClientError, PoolConfig};
