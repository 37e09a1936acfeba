//! Cooperative shutdown signalling.
//!
//! One `Shutdown` handle per process; every loop that may suspend (source
//! polls, filesystem-watch waits, backoff and scheduler sleeps, adapter
//! calls) holds a subscription and exits at the next opportunity after the
//! signal fires. In-flight adapter calls get a grace window from the
//! router before being abandoned.

use tokio::sync::watch;
use tracing::info;

/// Shutdown broadcaster.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Create an un-triggered shutdown handle.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Create a handle that triggers on SIGINT or SIGTERM.
    ///
    /// # Panics
    ///
    /// Panics if signal handlers cannot be registered (only happens outside
    /// a tokio runtime).
    #[must_use]
    pub fn listening() -> Self {
        let this = Self::new();
        let tx = this.tx.clone();
        tokio::spawn(async move {
            let triggered = wait_for_signal().await;
            info!(signal = triggered, "shutdown requested");
            let _ = tx.send(true);
        });
        this
    }

    /// Trigger shutdown programmatically.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Subscribe to the shutdown signal.
    #[must_use]
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is requested.
    pub async fn triggered(&mut self) {
        // An error means the sender is gone, which also means shutdown.
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        },
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_subscribers() {
        let shutdown = Shutdown::new();
        let mut token = shutdown.token();
        assert!(!token.is_triggered());

        shutdown.trigger();
        token.triggered().await;
        assert!(token.is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_shutdown() {
        let shutdown = Shutdown::new();
        let mut token = shutdown.token();
        drop(shutdown);
        token.triggered().await; // must not hang
    }
}
