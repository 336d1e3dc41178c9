//! Cooperative cancellation for long-running loops.
//!
//! [`Shutdown`] is held by whoever decides when the process stops (the
//! binary's ctrl-c handler, a test). Loops receive a [`ShutdownSignal`] and
//! `select!` on [`ShutdownSignal::cancelled`] next to their timer or pull.
//! Backed by a `watch` channel, so a signal sent before a loop starts
//! waiting is still observed.

use std::sync::Arc;
use tokio::sync::watch;

/// Trigger side of the cancellation channel.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Ask every loop holding a signal from this trigger to stop.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new receiver for a loop.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver side of the cancellation channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Non-blocking check, for use between units of work.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered.
    ///
    /// If every [`Shutdown`] handle is dropped without triggering, nobody can
    /// cancel anymore and this never resolves.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_observes_trigger() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
        });

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("signal should resolve")
            .unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_trigger_before_wait_is_not_missed() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        shutdown.trigger();

        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("early trigger should still cancel");
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_untriggered_signal_stays_pending() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();

        let result = tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cloned_signals_all_cancel() {
        let shutdown = Shutdown::new();
        let first = shutdown.signal();
        let second = first.clone();

        shutdown.trigger();
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
    }
}
