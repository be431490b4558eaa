//! Write-once, read-many result signal.

use std::sync::Arc;

use tokio::sync::watch;

/// At-most-once result shared between producers and waiters.
///
/// The first [`SingleShot::resolve`] wins; later calls return `false` and
/// leave the stored value untouched. Any number of clones may wait, before or
/// after resolution, and each observes the same value.
#[derive(Debug)]
pub struct SingleShot<T> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for SingleShot<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone> Default for SingleShot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SingleShot<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Stores `value` if nothing was stored yet. Returns whether this call won.
    pub fn resolve(&self, value: T) -> bool {
        let mut value = Some(value);
        let won = self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        });
        if !won {
            tracing::trace!("Ignoring second resolution of single-shot signal");
        }
        won
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Current value without waiting.
    pub fn peek(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Waits for the value.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives in `self`, so the channel cannot close here.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
