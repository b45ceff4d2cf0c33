//! Graceful Shutdown Handling
//!
//! Translates SIGTERM/SIGINT into a stop request for the event loop. The loop
//! itself runs on a blocking thread; this side lives on the tokio runtime and
//! only flips the loop's cooperative stop flag.

use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::LoopError;
use crate::event_loop::LoopHandle;
use crate::Result;

/// Shutdown coordinator that manages the graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// How long the event loop gets to wind down
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Trigger shutdown without an OS signal
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            warn!("Shutdown triggered with no subscribers");
        }
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C, then broadcast shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

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

    /// Stop the event loop once shutdown is broadcast on `shutdown_rx`, or
    /// return early if the loop finishes on its own. Waits at most `timeout`
    /// for the loop after asking it to stop.
    ///
    /// Subscribe before anything can trigger shutdown, otherwise the signal is
    /// lost.
    pub async fn supervise_loop(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
        handle: LoopHandle,
        mut event_loop: JoinHandle<std::result::Result<(), LoopError>>,
    ) -> Result<()> {
        tokio::select! {
            result = &mut event_loop => {
                return flatten_loop_result(result);
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown requested, stopping event loop");
                handle.stop();
            }
        }

        match tokio::time::timeout(self.timeout, event_loop).await {
            Ok(result) => flatten_loop_result(result),
            Err(_) => {
                warn!(
                    "Event loop did not stop within {:?}, exiting anyway",
                    self.timeout
                );
                Ok(())
            }
        }
    }
}

fn flatten_loop_result(
    result: std::result::Result<std::result::Result<(), LoopError>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(Ok(())) => {
            info!("Event loop finished");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Event loop failed: {}", e);
            Err(e.into())
        }
        Err(e) => {
            error!("Event loop task failed: {}", e);
            Err(anyhow::anyhow!("Event loop task failed: {}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{EventLoop, LoopOptions};
    use crate::handler::EchoHandler;
    use crate::listener::Listener;

    #[tokio::test]
    async fn test_shutdown_signal_broadcast() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut receiver = coordinator.subscribe();

        coordinator.trigger();

        assert!(receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_supervise_stops_running_loop() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let mut event_loop = EventLoop::new(listener, EchoHandler::new(), LoopOptions::default()).unwrap();
        let handle = event_loop.handle();
        let task = tokio::task::spawn_blocking(move || event_loop.run());

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let shutdown_rx = coordinator.subscribe();
        let trigger = coordinator.shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = trigger.send(());
        });

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            coordinator.supervise_loop(shutdown_rx, handle.clone(), task),
        )
        .await;

        assert!(result.is_ok(), "supervisor hung");
        assert!(result.unwrap().is_ok());
        assert!(handle.is_stopping());
    }

    #[tokio::test]
    async fn test_shutdown_before_supervision_is_not_lost() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let mut event_loop = EventLoop::new(listener, EchoHandler::new(), LoopOptions::default()).unwrap();
        let handle = event_loop.handle();
        let task = tokio::task::spawn_blocking(move || event_loop.run());

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let shutdown_rx = coordinator.subscribe();
        coordinator.trigger();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            coordinator.supervise_loop(shutdown_rx, handle.clone(), task),
        )
        .await;

        assert!(result.is_ok(), "early shutdown was dropped");
        assert!(result.unwrap().is_ok());
        assert!(handle.is_stopping());
    }
}
