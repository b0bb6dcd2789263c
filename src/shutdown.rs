use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Server-wide shutdown signal.
///
/// Every connection loop registers itself and watches the returned receiver;
/// `shutdown()` flips the flag so each loop can send a close frame and exit.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

/// Held by a registered connection loop. Dropping it deregisters the loop.
pub struct ShutdownGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Release);
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a connection loop for shutdown notification.
    pub fn register(&self) -> (ShutdownGuard, watch::Receiver<bool>) {
        self.active.fetch_add(1, Ordering::AcqRel);
        (
            ShutdownGuard {
                active: Arc::clone(&self.active),
            },
            self.tx.subscribe(),
        )
    }

    /// Signal every registered loop to close.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    /// Number of loops still registered.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Resolve once `shutdown()` has been called.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
