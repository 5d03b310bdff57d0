//! # Kepler Gateway Server
//!
//! Binary entry point: parses configuration, serves the router and drains
//! generation jobs on shutdown.

use kepler_gateway::{create_router, AppState, Config, GracefulShutdown, ShutdownConfig};
use tracing::info;

/// Scheme and host only, so credentials or paths never reach the logs.
fn safe_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(url) => format!("{}://{}", url.scheme(), url.host_str().unwrap_or("unknown")),
        Err(_) => "invalid-url".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from CLI args and .env file
    let config = Config::parse_args();

    let state = AppState::new(config.clone()).await?;
    let registry = state.registry().clone();
    let sweeper = registry.spawn_sweeper(config.sweep_interval());

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!("🚀 Kepler gateway starting on http://{}", listener.local_addr()?);
    info!("Chat backend: {} ({})", config.llm_backend, config.llm_model_name);
    if let Some(url) = &config.llm_api_url {
        info!("Chat URL: {}", safe_url(url));
    }
    info!("ComfyUI URL: {}", safe_url(&config.comfyui_url));
    info!("CogVideo URL: {}", safe_url(&config.cogvideo_url));

    let shutdown = GracefulShutdown::new();
    shutdown.listen_for_signals();

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.initiated().await })
        .await?;

    shutdown.drain_jobs(&registry, &ShutdownConfig::default()).await;
    let _ = sweeper.await;
    info!("✅ Kepler gateway stopped");

    Ok(())
}
