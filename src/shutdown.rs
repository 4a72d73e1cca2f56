//! Graceful Shutdown Handling
//!
//! Turns SIGTERM/SIGINT into a broadcast that stops the accept loop. Live
//! sessions are then given the configured grace period to finish.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::Result;

/// Shutdown coordinator that fans a single stop signal out to subscribers
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    triggered: AtomicBool,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            triggered: AtomicBool::new(false),
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast the shutdown signal.
    ///
    /// The request is also latched, so a component that subscribes late can
    /// check `is_triggered` before waiting.
    pub fn trigger(&self) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.shutdown_tx.send(()).is_err() {
            debug!("Shutdown requested with no active subscribers");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Wait for SIGTERM or SIGINT (Ctrl+C on Windows), then broadcast shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_shutdown_signal_broadcast() {
        let coordinator = ShutdownCoordinator::new();
        let mut first = coordinator.subscribe();
        let mut second = coordinator.subscribe();

        coordinator.trigger();

        assert!(first.recv().await.is_ok());
        assert!(second.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_subscriber_wakes_on_trigger() {
        let coordinator = ShutdownCoordinator::new();
        let mut shutdown_rx = coordinator.subscribe();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = sleep(Duration::from_secs(10)) => false,
                _ = shutdown_rx.recv() => true,
            }
        });

        sleep(Duration::from_millis(50)).await;
        coordinator.trigger();

        assert!(task.await.unwrap());
    }

    #[test]
    fn test_trigger_is_latched() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_triggered());

        coordinator.trigger();
        coordinator.trigger();
        assert!(coordinator.is_triggered());

        let mut late = coordinator.subscribe();
        assert!(late.try_recv().is_err());
    }
}
