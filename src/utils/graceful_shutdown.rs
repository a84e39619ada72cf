use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use eyre::Result;
use tokio::{signal, sync::broadcast};

/// Why the process is going down.
#[derive(Debug, Clone, Copy)]
pub enum ShutdownReason {
    /// SIGTERM / SIGINT, or an explicit trigger.
    Graceful,
    /// Drain window exceeded or channel lost.
    Force,
}

/// Coordinates shutdown across the serving tasks.
///
/// Signal handling fans out over a broadcast channel; the servers stop
/// accepting on the first signal and in-flight requests get a bounded drain
/// window before the process exits.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Default 30-second drain window.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            drain_timeout,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Trigger shutdown programmatically. Later triggers are ignored.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!(?reason, "shutdown triggered");
            let _ = self.shutdown_tx.send(reason);
        }
    }

    /// Listen for SIGTERM / SIGINT and broadcast the first one seen.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down gracefully");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("received SIGTERM, shutting down gracefully");
            }
        }
        self.trigger_shutdown(ShutdownReason::Graceful);
        Ok(())
    }

    /// Block until shutdown is signalled.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        // A signal may have fired before this subscriber existed.
        if self.is_shutdown_initiated() {
            return ShutdownReason::Graceful;
        }
        let mut receiver = self.subscribe();
        match receiver.recv().await {
            Ok(reason) => reason,
            Err(_) => {
                tracing::warn!("shutdown channel closed unexpectedly");
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
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_clean() {
        let shutdown = GracefulShutdown::new();
        assert!(!shutdown.is_shutdown_initiated());
        assert_eq!(shutdown.drain_timeout(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn manual_trigger_reaches_subscribers() {
        let shutdown = GracefulShutdown::new();
        let mut rx = shutdown.subscribe();

        shutdown.trigger_shutdown(ShutdownReason::Graceful);
        assert!(shutdown.is_shutdown_initiated());
        assert!(matches!(rx.try_recv().unwrap(), ShutdownReason::Graceful));
    }

    #[tokio::test]
    async fn second_trigger_is_ignored() {
        let shutdown = GracefulShutdown::new();
        let mut rx = shutdown.subscribe();

        shutdown.trigger_shutdown(ShutdownReason::Graceful);
        shutdown.trigger_shutdown(ShutdownReason::Force);

        assert!(matches!(rx.try_recv().unwrap(), ShutdownReason::Graceful));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wait_returns_the_broadcast_reason() {
        let shutdown = Arc::new(GracefulShutdown::new());
        let waiter = shutdown.clone();
        let task = tokio::spawn(async move { waiter.wait_for_shutdown_signal().await });

        // Give the waiter time to subscribe.
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.trigger_shutdown(ShutdownReason::Graceful);

        assert!(matches!(task.await.unwrap(), ShutdownReason::Graceful));
    }
}
