//! The gateway's stop latch.
//!
//! Once tripped it stays tripped, so a listener that starts waiting after
//! the signal (an admin API still binding, say) returns at once instead of
//! hanging on a message it missed.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

/// Shared stop latch. Clones trip and observe the same latch.
#[derive(Debug, Clone)]
pub struct Shutdown {
    latch: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (latch, _) = watch::channel(false);
        Self {
            latch: Arc::new(latch),
        }
    }

    /// Trip the latch. Idempotent.
    pub fn trigger(&self) {
        if !self.latch.send_replace(true) {
            tracing::debug!(waiters = self.latch.receiver_count(), "shutdown triggered");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.latch.borrow()
    }

    /// Resolves once the latch is tripped, including before this call.
    ///
    /// The future owns its receiver, so it can be handed to a spawned
    /// server as its graceful-shutdown signal.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.latch.subscribe();
        async move {
            // Err only once every clone is gone
            let _ = rx.wait_for(|tripped| *tripped).await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
