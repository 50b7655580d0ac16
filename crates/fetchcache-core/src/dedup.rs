//! In-flight request coalescing.
//!
//! Concurrent callers asking for the same key share one computation and all
//! observe its single outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

type PendingChannel<T> = Shared<oneshot::Receiver<T>>;
type PendingMap<T> = Arc<Mutex<HashMap<String, PendingChannel<T>>>>;

/// Removes its key from the pending map when dropped, including when the
/// spawned computation panics and its task is torn down.
struct PendingSlot<T> {
    pending: PendingMap<T>,
    key: String,
}

impl<T> Drop for PendingSlot<T> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.key);
    }
}

/// Errors that can occur while waiting on a coalesced computation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeduplicationError {
    /// The computation was dropped without producing a value, e.g. it panicked.
    #[error("computation ended without producing a result")]
    Abandoned,
}

/// Runs at most one computation per key at a time.
///
/// The first caller for a key spawns the operation onto the tokio runtime;
/// later callers for the same key get a handle to that same computation
/// until it settles. The key is removed from the pending map as soon as the
/// computation finishes, whether it produced a value, an error value or
/// panicked, so the next caller starts a fresh one.
pub struct Deduplicator<T> {
    pending: PendingMap<T>,
}

impl<T> Clone for Deduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T> Default for Deduplicator<T> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Deduplicator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the computation pending under `key`, or start `operation` if
    /// there is none.
    ///
    /// NOTE: This is not `async`: a new computation is spawned eagerly and
    /// runs to completion even if the returned future is never polled.
    /// Must be called from within a tokio runtime.
    pub fn execute<F, Fut>(
        &self,
        key: impl Into<String>,
        operation: F,
    ) -> BoxFuture<'static, Result<T, DeduplicationError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let key = key.into();

        let channel = {
            let mut pending = self.pending.lock();
            if let Some(channel) = pending.get(&key) {
                debug!(key = %key, "Joining in-flight request");
                channel.clone()
            } else {
                debug!(key = %key, "Starting new request");
                // If `operation` panics here nothing has been inserted yet.
                let computation = operation();
                let channel = self.spawn(key.clone(), computation);
                pending.insert(key, channel.clone());
                channel
            }
        };

        channel
            .map(|result| result.map_err(|_cancelled| DeduplicationError::Abandoned))
            .boxed()
    }

    fn spawn<Fut>(&self, key: String, computation: Fut) -> PendingChannel<T>
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let slot = PendingSlot {
            pending: Arc::clone(&self.pending),
            key,
        };

        tokio::spawn(async move {
            let result = computation.await;
            // Evict before publishing, so a caller either receives this result
            // or starts a new computation.
            drop(slot);
            sender.send(result).ok();
        });

        receiver.shared()
    }

    /// Number of keys with a computation in flight
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().contains_key(key)
    }
}
