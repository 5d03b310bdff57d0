//! # Graceful Shutdown Module
//!
//! Signal handling and shutdown sequencing for the gateway.
//!
//! ## Shutdown Process:
//!
//! 1. **Signal Reception**: SIGINT, SIGTERM or SIGQUIT trips the shutdown token
//! 2. **Stop Accepting**: axum stops accepting connections and drains open ones
//! 3. **Drain Jobs**: poll tasks are cancelled and unfinished jobs marked failed
//! 4. **Exit**

use std::time::Duration;
#[cfg(feature = "server")]
use tokio::signal;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::jobs::JobRegistry;

/// # Graceful Shutdown Manager
///
/// Clones share one token, so any clone can trigger or observe shutdown.
#[derive(Clone, Default)]
pub struct GracefulShutdown {
    token: CancellationToken,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn initiate_shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("🛑 Graceful shutdown initiated");
        }
        self.token.cancel();
    }

    /// Resolves once shutdown has been initiated. Pass this to
    /// `axum::serve(..).with_graceful_shutdown(..)`.
    pub async fn initiated(&self) {
        self.token.cancelled().await
    }

    /// Wait for SIGINT, SIGTERM or SIGQUIT and initiate shutdown.
    #[cfg(all(feature = "server", unix))]
    pub async fn wait_for_shutdown_signal(&self) -> std::io::Result<()> {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigquit = signal::unix::signal(signal::unix::SignalKind::quit())?;

        tokio::select! {
            _ = signal::ctrl_c() => info!("📡 Received SIGINT (Ctrl+C)"),
            _ = sigterm.recv() => info!("📡 Received SIGTERM"),
            _ = sigquit.recv() => info!("📡 Received SIGQUIT"),
            _ = self.token.cancelled() => return Ok(()),
        }

        self.initiate_shutdown();
        Ok(())
    }

    /// Wait for Ctrl+C and initiate shutdown.
    #[cfg(all(feature = "server", not(unix)))]
    pub async fn wait_for_shutdown_signal(&self) -> std::io::Result<()> {
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("📡 Received Ctrl+C");
            }
            _ = self.token.cancelled() => return Ok(()),
        }

        self.initiate_shutdown();
        Ok(())
    }

    /// Spawn the signal listener in the background.
    #[cfg(feature = "server")]
    pub fn listen_for_signals(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.wait_for_shutdown_signal().await {
                error!("❌ Error waiting for shutdown signal: {}", e);
            }
        });
    }

    /// Stop all job work, bounded by `config.shutdown_timeout`.
    pub async fn drain_jobs(&self, registry: &JobRegistry, config: &ShutdownConfig) {
        info!("🛑 Draining generation jobs (timeout: {:?})", config.shutdown_timeout);

        match timeout(config.shutdown_timeout, registry.shutdown(config.task_grace)).await {
            Ok(()) => info!("✅ Job registry drained"),
            Err(_) => warn!("⏰ Job drain exceeded {:?}, exiting anyway", config.shutdown_timeout),
        }
    }
}

/// # Server Shutdown Configuration
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Upper bound on the whole job drain
    pub shutdown_timeout: Duration,
    /// Time poll tasks get to observe cancellation before being aborted
    pub task_grace: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            task_grace: Duration::from_secs(5),
        }
    }
}
