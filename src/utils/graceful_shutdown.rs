use std::time::Duration;

use eyre::{Result, WrapErr};
use tokio::{signal, sync::watch};

/// Why the gateway is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM
    Signal,
    /// Requested from inside the process
    Requested,
}

/// Coordinates the stop of the listener and the drain of in-flight requests.
///
/// Once triggered, the listener stops accepting and in-flight requests get
/// `drain_timeout` to finish before the process gives up on them.
pub struct GracefulShutdown {
    shutdown_tx: watch::Sender<Option<ShutdownReason>>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    pub fn with_timeout(drain_timeout: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(None);
        Self {
            shutdown_tx,
            drain_timeout,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_tx.borrow().is_some()
    }

    /// Trigger shutdown. Only the first call has any effect.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        let first = self.shutdown_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if first {
            tracing::info!(?reason, "Shutdown initiated");
        } else {
            tracing::warn!(?reason, "Shutdown already initiated, ignoring");
        }
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for SIGINT")?;
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            result = wait_for_sigterm() => {
                result?;
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.trigger_shutdown(ShutdownReason::Signal);
        Ok(())
    }

    /// Resolve once shutdown has been triggered, including before the call.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        self.shutdown_token().wait_for_shutdown().await
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.shutdown_tx.subscribe(),
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("Failed to register SIGTERM handler")?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}

/// Handle handed to tasks that must stop when the gateway does.
#[derive(Clone)]
pub struct ShutdownToken {
    receiver: watch::Receiver<Option<ShutdownReason>>,
}

impl ShutdownToken {
    pub fn is_shutdown_initiated(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    pub async fn wait_for_shutdown(&mut self) -> ShutdownReason {
        match self.receiver.wait_for(Option::is_some).await {
            Ok(reason) => reason.unwrap_or(ShutdownReason::Requested),
            // sender dropped: the manager is gone, nothing left to wait for
            Err(_) => ShutdownReason::Requested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_reaches_existing_and_late_tokens() {
        let shutdown = GracefulShutdown::with_timeout(Duration::from_secs(10));
        let mut early = shutdown.shutdown_token();
        assert!(!early.is_shutdown_initiated());

        shutdown.trigger_shutdown(ShutdownReason::Requested);
        assert!(shutdown.is_shutdown_initiated());
        assert_eq!(early.wait_for_shutdown().await, ShutdownReason::Requested);

        let mut late = shutdown.shutdown_token();
        assert_eq!(late.wait_for_shutdown().await, ShutdownReason::Requested);
        assert_eq!(
            shutdown.wait_for_shutdown_signal().await,
            ShutdownReason::Requested
        );
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let shutdown = GracefulShutdown::with_timeout(Duration::from_secs(1));
        shutdown.trigger_shutdown(ShutdownReason::Signal);
        shutdown.trigger_shutdown(ShutdownReason::Requested);
        assert_eq!(
            shutdown.wait_for_shutdown_signal().await,
            ShutdownReason::Signal
        );
        assert_eq!(shutdown.drain_timeout(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_token_waits_until_triggered() {
        let shutdown = GracefulShutdown::with_timeout(Duration::from_secs(1));
        let mut token = shutdown.shutdown_token();

        let pending = tokio::time::timeout(Duration::from_millis(20), token.wait_for_shutdown()).await;
        assert!(pending.is_err());
    }
}
