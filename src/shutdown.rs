//! Cooperative cancellation shared by every long-running task.

use tokio::{sync::watch, time::Duration};

/// Raises the shutdown signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Signals every [`Shutdown`] clone.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observes the shutdown signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// A connected trigger and observer pair.
    pub fn new() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, Shutdown { rx })
    }

    /// The signal has been raised.
    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal is raised or the trigger is dropped.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|set| *set).await;
    }

    /// Sleeps for `dur`; returns false when shutdown cut the sleep short.
    pub async fn sleep(&mut self, dur: Duration) -> bool {
        if self.is_set() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => true,
            _ = self.wait() => false,
        }
    }
}
