use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use eyre::Result;
use tokio::{signal, sync::broadcast};

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Graceful shutdown requested (SIGTERM): stop accepting, drain in-flight
    Graceful,
    /// Fast shutdown requested (SIGINT): exit without draining
    Fast,
    /// Force shutdown (channel lost or drain timeout exceeded)
    Force,
}

/// Manages shutdown signalling for the server and background tasks.
pub struct GracefulShutdown {
    /// Broadcast sender for shutdown signals
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    /// Flag indicating if shutdown has been initiated
    shutdown_initiated: Arc<AtomicBool>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get a receiver for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Manually trigger shutdown (useful for tests and API-triggered stops)
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("Shutdown triggered: {:?}", reason);
            let _ = self.shutdown_tx.send(reason);
        } else {
            tracing::warn!("Shutdown already initiated, ignoring signal");
        }
    }

    /// Listen for OS termination signals: SIGTERM drains gracefully, SIGINT
    /// exits fast.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!(
            "Signal handler started. SIGTERM drains in-flight requests, SIGINT stops immediately"
        );

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Received SIGINT, fast shutdown");
                self.trigger_shutdown(ShutdownReason::Fast);
            }
            _ = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, graceful shutdown");
                self.trigger_shutdown(ShutdownReason::Graceful);
            }
        }

        Ok(())
    }

    /// Wait until a shutdown of the given kind is requested.
    pub async fn wait_for(&self, kind: ShutdownReason) {
        let mut receiver = self.subscribe();
        loop {
            match receiver.recv().await {
                Ok(reason) if reason == kind => return,
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    }

    /// Wait for any shutdown signal.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let mut receiver = self.subscribe();
        match receiver.recv().await {
            Ok(reason) => reason,
            Err(_) => {
                tracing::warn!("Shutdown channel closed unexpectedly");
                ShutdownReason::Force
            }
        }
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
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<()>().await;
}

/// Forward SIGHUP and SIGUSR1 into the reload channel. Runs until shutdown.
#[cfg(unix)]
pub async fn run_reload_signal_listener(reload_tx: tokio::sync::mpsc::Sender<()>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to register SIGHUP handler: {e}");
            return;
        }
    };
    let mut sigusr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to register SIGUSR1 handler: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sighup.recv() => {}
            _ = sigusr1.recv() => {}
        }
        tracing::info!("Reload signal received");
        // A full channel means a reload is already pending; coalesce.
        let _ = reload_tx.try_send(());
    }
}

#[cfg(not(unix))]
pub async fn run_reload_signal_listener(_reload_tx: tokio::sync::mpsc::Sender<()>) {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_graceful_shutdown_creation() {
        let shutdown = GracefulShutdown::new();
        assert!(!shutdown.is_shutdown_initiated());
    }

    #[tokio::test]
    async fn test_manual_trigger_shutdown() {
        let shutdown = GracefulShutdown::new();

        shutdown.trigger_shutdown(ShutdownReason::Graceful);
        assert!(shutdown.is_shutdown_initiated());

        let mut receiver = shutdown.subscribe();
        let reason = receiver.try_recv().unwrap();
        assert!(matches!(reason, ShutdownReason::Graceful));
    }

    #[tokio::test]
    async fn second_trigger_is_ignored() {
        let shutdown = GracefulShutdown::new();
        let mut receiver = shutdown.subscribe();

        shutdown.trigger_shutdown(ShutdownReason::Fast);
        shutdown.trigger_shutdown(ShutdownReason::Graceful);

        assert!(matches!(receiver.try_recv().unwrap(), ShutdownReason::Fast));
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn wait_for_matches_only_requested_kind() {
        let shutdown = Arc::new(GracefulShutdown::new());
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.wait_for(ShutdownReason::Graceful).await });

        shutdown.trigger_shutdown(ShutdownReason::Graceful);
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("wait_for should resolve")
            .unwrap();
    }
}
