use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Graceful shutdown requested (SIGTERM, SIGINT)
    Graceful,
    /// Triggered from inside the process, e.g. a fatal listener error
    Internal,
}

/// Turns OS signals into cancellation of one root token.
///
/// Every long-running task (entry points, health checks, config providers)
/// holds a child of [`GracefulShutdown::token`], so one signal stops them
/// all. `drain_timeout` bounds how long entry points wait for open
/// connections afterwards.
#[derive(Clone)]
pub struct GracefulShutdown {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a new GracefulShutdown manager with default 30-second drain timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
            drain_timeout,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The first reason recorded, if shutdown has started.
    pub fn reason(&self) -> Option<ShutdownReason> {
        match self.reason.lock() {
            Ok(reason) => *reason,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        {
            let mut slot = match self.reason.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slot.is_some() {
                tracing::warn!(?reason, "Shutdown already initiated, ignoring");
                return;
            }
            *slot = Some(reason);
        }
        tracing::info!(?reason, "Shutdown initiated");
        self.token.cancel();
    }

    /// Waits for SIGINT or SIGTERM (or an internal trigger) and cancels the
    /// root token.
    pub async fn run_signal_handler(&self) {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");
        tokio::select! {
            () = self.token.cancelled() => return,
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                    return;
                }
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            () = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }
        self.trigger(ShutdownReason::Graceful);
    }

    pub async fn wait(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Internal)
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<()>().await;
}
