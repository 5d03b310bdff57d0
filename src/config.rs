#[cfg(feature = "cli")]
use clap::Parser;
use std::time::Duration;
use url::Url;

use crate::error::ProxyError;

/// Default local address of an Ollama server.
pub const OLLAMA_LOCAL_URL: &str = "http://localhost:11434";
/// Default local address of an OpenAI-compatible server (vLLM).
pub const OPENAI_COMPAT_LOCAL_URL: &str = "http://localhost:8000";

/// # Kepler Gateway Configuration
///
/// Command-line arguments with environment variable fallbacks and `.env`
/// loading. Upstream URLs are validated lazily per request as well, so a
/// misconfigured backend produces a client-visible configuration error
/// instead of a crash at startup.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "cli", derive(Parser))]
#[cfg_attr(feature = "cli", command(name = "kepler"))]
#[cfg_attr(feature = "cli", command(about = "HTTP gateway relaying chat streams and tracking image/video generation jobs"))]
#[cfg_attr(feature = "cli", command(version))]
pub struct Config {
    // =============================================================================
    // CORE SERVER CONFIGURATION
    // =============================================================================

    /// Server port to listen on
    #[cfg_attr(feature = "cli", arg(short, long, env = "PORT", default_value = "3000"))]
    pub port: u16,

    /// Server host to bind to
    #[cfg_attr(feature = "cli", arg(long, env = "HOST", default_value = "0.0.0.0"))]
    pub host: String,

    /// Environment (development, production)
    #[cfg_attr(feature = "cli", arg(long, env = "ENVIRONMENT", default_value = "development"))]
    pub environment: String,

    // =============================================================================
    // CHAT BACKEND
    // =============================================================================

    /// Chat backend base URL. Falls back to a local default in development.
    #[cfg_attr(feature = "cli", arg(long, env = "LLM_API_URL"))]
    pub llm_api_url: Option<String>,

    /// Optional bearer token for the chat backend
    #[cfg_attr(feature = "cli", arg(long, env = "LLM_API_KEY"))]
    pub llm_api_key: Option<String>,

    /// Chat backend flavour (ollama, openai)
    #[cfg_attr(feature = "cli", arg(long, env = "LLM_BACKEND", default_value = "ollama"))]
    pub llm_backend: String,

    /// Model name sent upstream
    #[cfg_attr(feature = "cli", arg(long, env = "LLM_MODEL_NAME", default_value = "qwen2.5"))]
    pub llm_model_name: String,

    /// System prompt prepended to conversations that carry none
    #[cfg_attr(feature = "cli", arg(long, env = "SYSTEM_PROMPT"))]
    pub system_prompt: Option<String>,

    // =============================================================================
    // GENERATION BACKENDS
    // =============================================================================

    /// ComfyUI base URL
    #[cfg_attr(feature = "cli", arg(long, env = "COMFYUI_URL", default_value = "http://127.0.0.1:8188"))]
    pub comfyui_url: String,

    /// Checkpoint loaded by the text-to-image workflow
    #[cfg_attr(feature = "cli", arg(long, env = "COMFYUI_CHECKPOINT", default_value = "sd_turbo.safetensors"))]
    pub comfyui_checkpoint: String,

    /// CogVideo base URL
    #[cfg_attr(feature = "cli", arg(long, env = "COGVIDEO_URL", default_value = "http://localhost:7860"))]
    pub cogvideo_url: String,

    /// Prefix under which finished videos are served
    #[cfg_attr(feature = "cli", arg(long, env = "VIDEO_URL_PREFIX", default_value = "/videos"))]
    pub video_url_prefix: String,

    /// Upper bound on requested video frames
    #[cfg_attr(feature = "cli", arg(long, env = "MAX_VIDEO_FRAMES", default_value = "8"))]
    pub max_video_frames: u32,

    // =============================================================================
    // HTTP CLIENT AND STREAMING
    // =============================================================================

    /// Timeout in seconds for non-streaming upstream requests
    #[cfg_attr(feature = "cli", arg(long, env = "HTTP_CLIENT_TIMEOUT", default_value = "30"))]
    pub http_client_timeout: u64,

    /// Connect timeout in seconds
    #[cfg_attr(feature = "cli", arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10"))]
    pub http_connect_timeout: u64,

    /// Maximum idle connections kept per upstream host
    #[cfg_attr(feature = "cli", arg(long, env = "HTTP_CLIENT_MAX_CONNECTIONS_PER_HOST", default_value = "10"))]
    pub http_client_max_connections_per_host: usize,

    /// Upper bound in seconds on a single relayed chat stream
    #[cfg_attr(feature = "cli", arg(long, env = "STREAMING_TIMEOUT", default_value = "300"))]
    pub streaming_timeout: u64,

    // =============================================================================
    // JOBS
    // =============================================================================

    /// Delay between status polls in milliseconds
    #[cfg_attr(feature = "cli", arg(long, env = "POLL_INTERVAL_MS", default_value = "2000"))]
    pub poll_interval_ms: u64,

    /// Poll attempts before an image job times out
    #[cfg_attr(feature = "cli", arg(long, env = "IMAGE_POLL_ATTEMPTS", default_value = "60"))]
    pub image_poll_attempts: u32,

    /// Poll attempts before a video job times out
    #[cfg_attr(feature = "cli", arg(long, env = "VIDEO_POLL_ATTEMPTS", default_value = "120"))]
    pub video_poll_attempts: u32,

    /// Seconds a finished job stays queryable
    #[cfg_attr(feature = "cli", arg(long, env = "JOB_TTL_SECONDS", default_value = "3600"))]
    pub job_ttl_seconds: u64,

    /// Seconds between registry sweeps
    #[cfg_attr(feature = "cli", arg(long, env = "JOB_SWEEP_INTERVAL_SECONDS", default_value = "60"))]
    pub job_sweep_interval_seconds: u64,

    /// Maximum jobs in flight at once (0 = unlimited)
    #[cfg_attr(feature = "cli", arg(long, env = "MAX_ACTIVE_JOBS", default_value = "32"))]
    pub max_active_jobs: usize,

    // =============================================================================
    // LOGGING AND SECURITY
    // =============================================================================

    /// Log level (error, warn, info, debug, trace)
    #[cfg_attr(feature = "cli", arg(long, env = "RUST_LOG", default_value = "info"))]
    pub log_level: String,

    /// CORS origin (use * for development only)
    #[cfg_attr(feature = "cli", arg(long, env = "CORS_ORIGIN", default_value = "*"))]
    pub cors_origin: String,
}

/// Which upstream a URL is being resolved for. Drives error wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    Chat,
    Image,
    Video,
}

impl Upstream {
    pub fn env_var(&self) -> &'static str {
        match self {
            Upstream::Chat => "LLM_API_URL",
            Upstream::Image => "COMFYUI_URL",
            Upstream::Video => "COGVIDEO_URL",
        }
    }
}

impl Config {
    /// Parse configuration from command line arguments and environment variables.
    ///
    /// Loads `.env` if present, initialises logging and exits with a readable
    /// message when validation fails.
    #[cfg(feature = "cli")]
    pub fn parse_args() -> Self {
        let _ = dotenv::dotenv();

        let config = Self::parse();
        config.setup_logging();

        if let Err(err) = config.validate() {
            eprintln!("Configuration validation failed: {}", err);
            std::process::exit(1);
        }

        config
    }

    /// Create a test configuration with minimal required fields.
    pub fn for_test() -> Self {
        Self {
            port: 3000,
            host: "127.0.0.1".to_string(),
            environment: "development".to_string(),
            llm_api_url: Some(OLLAMA_LOCAL_URL.to_string()),
            llm_api_key: None,
            llm_backend: "ollama".to_string(),
            llm_model_name: "qwen2.5".to_string(),
            system_prompt: None,
            comfyui_url: "http://127.0.0.1:8188".to_string(),
            comfyui_checkpoint: "sd_turbo.safetensors".to_string(),
            cogvideo_url: "http://localhost:7860".to_string(),
            video_url_prefix: "/videos".to_string(),
            max_video_frames: 8,
            http_client_timeout: 30,
            http_connect_timeout: 10,
            http_client_max_connections_per_host: 10,
            streaming_timeout: 300,
            poll_interval_ms: 2000,
            image_poll_attempts: 60,
            video_poll_attempts: 120,
            job_ttl_seconds: 3600,
            job_sweep_interval_seconds: 60,
            max_active_jobs: 32,
            log_level: "info".to_string(),
            cors_origin: "*".to_string(),
        }
    }

    #[cfg(feature = "cli")]
    fn setup_logging(&self) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(&self.log_level)
            .with_target(false)
            .try_init();
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.job_sweep_interval_seconds)
    }

    /// Resolve and check the base URL for an upstream.
    ///
    /// Fails with [`ProxyError::Configuration`] when the URL is unset, is not
    /// an absolute http(s) URL, or points at a loopback host while running in
    /// production, where it can never be reached from the deployed gateway.
    pub fn upstream_url(&self, upstream: Upstream) -> Result<String, ProxyError> {
        let raw = match upstream {
            Upstream::Chat => self.llm_api_url.clone().filter(|u| !u.trim().is_empty()).or_else(|| {
                if self.is_production() {
                    None
                } else if self.llm_backend == "openai" {
                    Some(OPENAI_COMPAT_LOCAL_URL.to_string())
                } else {
                    Some(OLLAMA_LOCAL_URL.to_string())
                }
            }),
            Upstream::Image => Some(self.comfyui_url.clone()).filter(|u| !u.trim().is_empty()),
            Upstream::Video => Some(self.cogvideo_url.clone()).filter(|u| !u.trim().is_empty()),
        };

        let var = upstream.env_var();
        let raw = raw.ok_or_else(|| {
            ProxyError::configuration(
                format!("{} environment variable is not set", var),
                format!("Set {} in the environment or .env file to point at the backend server.", var),
            )
        })?;

        let parsed = Url::parse(raw.trim()).map_err(|e| {
            ProxyError::configuration(
                format!("{} is not a valid URL: {}", var, e),
                format!("Current {}: {}", var, raw),
            )
        })?;

        if !["http", "https"].contains(&parsed.scheme()) {
            return Err(ProxyError::configuration(
                format!("{} must use http or https, not '{}'", var, parsed.scheme()),
                format!("Current {}: {}", var, raw),
            ));
        }

        if self.is_production() && is_loopback(&parsed) {
            return Err(ProxyError::configuration(
                format!("{} cannot point at localhost in production", var),
                format!(
                    "Current {}: {}. Expose the backend through a tunnel or reachable host and update {}.",
                    var, raw, var
                ),
            ));
        }

        Ok(raw.trim().trim_end_matches('/').to_string())
    }

    /// Validate configuration values and provide helpful error messages.
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0. Please specify a valid port number (1-65535).".to_string());
        }

        if self.host.is_empty() {
            return Err("Host cannot be empty. Please specify a valid host (e.g., '0.0.0.0', 'localhost', or an IP address).".to_string());
        }

        let valid_environments = ["development", "production"];
        if !valid_environments.contains(&self.environment.as_str()) {
            return Err(format!(
                "Invalid environment '{}'. Valid options are: {}",
                self.environment,
                valid_environments.join(", ")
            ));
        }

        let valid_backends = ["ollama", "openai"];
        if !valid_backends.contains(&self.llm_backend.as_str()) {
            return Err(format!(
                "Invalid LLM backend '{}'. Valid options are: {}",
                self.llm_backend,
                valid_backends.join(", ")
            ));
        }

        if self.llm_model_name.trim().is_empty() {
            return Err("Model name cannot be empty. Please set LLM_MODEL_NAME.".to_string());
        }

        if self.http_client_timeout == 0 {
            return Err("HTTP client timeout must be greater than 0 seconds.".to_string());
        }
        if self.http_connect_timeout == 0 {
            return Err("HTTP connect timeout must be greater than 0 seconds.".to_string());
        }
        if self.streaming_timeout == 0 {
            return Err("Streaming timeout must be greater than 0 seconds.".to_string());
        }

        if self.poll_interval_ms == 0 {
            return Err("Poll interval must be greater than 0 milliseconds.".to_string());
        }
        if self.image_poll_attempts == 0 || self.video_poll_attempts == 0 {
            return Err("Poll attempt budgets must be greater than 0.".to_string());
        }
        if self.max_video_frames == 0 {
            return Err("MAX_VIDEO_FRAMES must be greater than 0.".to_string());
        }
        if self.job_sweep_interval_seconds == 0 {
            return Err("Job sweep interval must be greater than 0 seconds.".to_string());
        }

        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Valid options are: {}",
                self.log_level,
                valid_log_levels.join(", ")
            ));
        }

        // Upstream URLs are checked again per request; warn early here.
        for upstream in [Upstream::Chat, Upstream::Image, Upstream::Video] {
            if let Err(err) = self.upstream_url(upstream) {
                eprintln!("⚠️  Warning: {}", err);
            }
        }

        if self.is_production() && self.cors_origin == "*" {
            eprintln!(
                "⚠️  Warning: Using CORS origin '*' in production is not recommended. \
                Consider specifying specific origins for better security."
            );
        }

        Ok(())
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_test_config_is_valid() {
        assert!(Config::for_test().validate().is_ok());
    }

    #[test]
    fn test_chat_url_falls_back_in_development() {
        let mut config = Config::for_test();
        config.llm_api_url = None;
        assert_eq!(config.upstream_url(Upstream::Chat).unwrap(), OLLAMA_LOCAL_URL);

        config.llm_backend = "openai".to_string();
        assert_eq!(config.upstream_url(Upstream::Chat).unwrap(), OPENAI_COMPAT_LOCAL_URL);
    }

    #[test]
    fn test_chat_url_required_in_production() {
        let mut config = Config::for_test();
        config.environment = "production".to_string();
        config.llm_api_url = None;

        let err = config.upstream_url(Upstream::Chat).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("LLM_API_URL"));
    }

    #[test]
    fn test_localhost_rejected_in_production() {
        let mut config = Config::for_test();
        config.environment = "production".to_string();
        config.llm_api_url = Some("http://127.0.0.1:11434".to_string());

        let err = config.upstream_url(Upstream::Chat).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("localhost"));

        config.llm_api_url = Some("https://llm.example.com/".to_string());
        assert_eq!(
            config.upstream_url(Upstream::Chat).unwrap(),
            "https://llm.example.com"
        );
    }

    #[test]
    fn test_empty_generation_url_is_configuration_error() {
        let mut config = Config::for_test();
        config.comfyui_url = "  ".to_string();
        let err = config.upstream_url(Upstream::Image).unwrap_err();
        assert!(err.to_string().contains("COMFYUI_URL"));
    }

    #[test]
    fn test_invalid_scheme_rejected() {
        let mut config = Config::for_test();
        config.cogvideo_url = "ftp://localhost:7860".to_string();
        assert!(config.upstream_url(Upstream::Video).unwrap_err().is_configuration());
    }

    #[test]
    fn test_validate_rejects_unknown_backend() {
        let mut config = Config::for_test();
        config.llm_backend = "lightllm".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_poll_budget() {
        let mut config = Config::for_test();
        config.video_poll_attempts = 0;
        assert!(config.validate().is_err());
    }
}
