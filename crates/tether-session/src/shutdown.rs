//! Process-wide cooperative shutdown signal.

use std::sync::Arc;

use tokio::sync::watch;

/// A latch every long-running task watches.
///
/// Cloning is cheap and every clone triggers the same latch. Once
/// triggered it stays triggered.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A receiver for `select!` loops. Its current value is already
    /// `true` if shutdown was triggered before the call.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once shutdown is triggered.
    pub async fn triggered(&self) {
        let mut rx = self.subscribe();
        // Errs only once the sender is dropped; `self` holds it.
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
