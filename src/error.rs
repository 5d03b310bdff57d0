//! # Error Types
//!
//! Every failure the gateway can report falls into one of a few categories,
//! and each category needs a different fix from the operator:
//!
//! - **Configuration**: an upstream URL is unset or unusable. Fix the config.
//! - **Unreachable**: the backend refused the connection or timed out. Start it.
//! - **UpstreamStatus**: the backend answered with a non-2xx status. Read its message.
//!
//! The remaining variants cover caller mistakes and internal faults.

#[cfg(feature = "server")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
#[cfg(feature = "server")]
use serde_json::json;
use thiserror::Error;

/// Longest upstream error body excerpt carried into a client-visible message.
pub const UPSTREAM_EXCERPT_LIMIT: usize = 512;

#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Required configuration is missing or cannot work in this environment.
    #[error("Configuration error: {message}")]
    Configuration { message: String, details: String },

    /// The backend could not be reached at all.
    #[error("{message}")]
    Unreachable {
        backend: String,
        url: String,
        message: String,
    },

    /// The backend answered with a non-success status.
    #[error("{backend} returned status {status}: {body}")]
    UpstreamStatus {
        backend: String,
        status: u16,
        body: String,
    },

    /// The backend answered successfully but with something we cannot use.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("{0}")]
    Busy(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ProxyError {
    pub fn configuration(message: impl Into<String>, details: impl Into<String>) -> Self {
        ProxyError::Configuration {
            message: message.into(),
            details: details.into(),
        }
    }

    /// Classify a transport-level failure talking to `backend` at `url`.
    ///
    /// Connection refusals and DNS failures become [`ProxyError::Unreachable`]
    /// with a hint to start the service; timeouts get their own wording.
    pub fn from_transport(backend: &str, url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::Unreachable {
                backend: backend.to_string(),
                url: url.to_string(),
                message: format!(
                    "{} connection timeout. Please check that {} is running and responsive at {}",
                    backend, backend, url
                ),
            }
        } else if err.is_connect() {
            ProxyError::Unreachable {
                backend: backend.to_string(),
                url: url.to_string(),
                message: format!(
                    "Cannot connect to {} at {}. Please ensure {} is running and accessible.",
                    backend, url, backend
                ),
            }
        } else if let Some(status) = err.status() {
            ProxyError::UpstreamStatus {
                backend: backend.to_string(),
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else if err.is_decode() || err.is_body() {
            ProxyError::Upstream(format!("{} sent an unreadable response: {}", backend, err))
        } else {
            ProxyError::Unreachable {
                backend: backend.to_string(),
                url: url.to_string(),
                message: format!("Request to {} at {} failed: {}", backend, url, err),
            }
        }
    }

    /// Build an upstream-status error, truncating the body to a readable excerpt.
    pub fn from_status(backend: &str, status: u16, body: &str) -> Self {
        ProxyError::UpstreamStatus {
            backend: backend.to_string(),
            status,
            body: excerpt(body),
        }
    }

    /// Short machine-readable category name used in error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "invalid_request_error",
            ProxyError::NotFound(_) => "not_found_error",
            ProxyError::Conflict(_) => "conflict_error",
            ProxyError::Configuration { .. } => "configuration_error",
            ProxyError::Unreachable { .. } => "connection_error",
            ProxyError::UpstreamStatus { .. } | ProxyError::Upstream(_) => "upstream_error",
            ProxyError::Busy(_) => "busy_error",
            ProxyError::Internal(_) => "internal_error",
            ProxyError::Serialization(_) => "serialization_error",
        }
    }

    /// Extra context for the operator, when there is any.
    pub fn details(&self) -> Option<String> {
        match self {
            ProxyError::Configuration { details, .. } => Some(details.clone()),
            ProxyError::Unreachable { url, .. } => Some(format!("Tried to connect to: {}", url)),
            ProxyError::UpstreamStatus { body, .. } => Some(body.clone()),
            _ => None,
        }
    }

    /// True for failures caused by the gateway's own configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(self, ProxyError::Configuration { .. })
    }

    /// True when the backend could not be reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ProxyError::Unreachable { .. })
    }
}

#[cfg(feature = "server")]
impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Conflict(_) => StatusCode::CONFLICT,
            ProxyError::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Unreachable { .. } | ProxyError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            // Relay the backend's own error status; anything else is a bad gateway.
            ProxyError::UpstreamStatus { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) | ProxyError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[cfg(feature = "server")]
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "{}", self);
        } else {
            tracing::debug!(kind = self.kind(), "{}", self);
        }

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "details": self.details(),
            }
        }));

        (status, body).into_response()
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<url::ParseError> for ProxyError {
    fn from(err: url::ParseError) -> Self {
        ProxyError::BadRequest(format!("Invalid URL: {}", err))
    }
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= UPSTREAM_EXCERPT_LIMIT {
        return trimmed.to_string();
    }
    let mut end = UPSTREAM_EXCERPT_LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_excerpt_is_truncated() {
        let body = "x".repeat(UPSTREAM_EXCERPT_LIMIT * 2);
        let err = ProxyError::from_status("Ollama", 500, &body);
        match err {
            ProxyError::UpstreamStatus { body, status, .. } => {
                assert_eq!(status, 500);
                assert!(body.len() <= UPSTREAM_EXCERPT_LIMIT + '…'.len_utf8());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        let body = "é".repeat(UPSTREAM_EXCERPT_LIMIT);
        let cut = excerpt(&body);
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn test_kinds_distinguish_remediation() {
        let config = ProxyError::configuration("LLM_API_URL is not set", "set it");
        let down = ProxyError::Unreachable {
            backend: "ComfyUI".into(),
            url: "http://127.0.0.1:8188".into(),
            message: "Cannot connect".into(),
        };
        let rejected = ProxyError::from_status("ComfyUI", 400, "bad workflow");

        assert_eq!(config.kind(), "configuration_error");
        assert_eq!(down.kind(), "connection_error");
        assert_eq!(rejected.kind(), "upstream_error");
        assert!(config.is_configuration());
        assert!(down.is_unreachable());
        assert_eq!(rejected.details().as_deref(), Some("bad workflow"));
    }

    #[cfg(feature = "server")]
    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            ProxyError::from_status("Ollama", 404, "model not found").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyError::from_status("Ollama", 302, "").status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::configuration("x", "y").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyError::Busy("too many jobs".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
