//! One-shot completion signal
//!
//! A latching "done" flag shared between the controller, its
//! underlays and their tasks. Closing is idempotent; late observers
//! still see the closed state.

use std::sync::Arc;

use tokio::sync::watch;

/// Latching completion signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal. Safe to call more than once; only the first
    /// call changes state.
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has been raised.
    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal is raised. Returns immediately if it
    /// already was.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
