//! Per-target mutual exclusion.
//!
//! Each target id owns a FIFO queue (a fair `tokio::sync::Mutex`). Callers
//! for the same id run one at a time in the order they arrived; callers for
//! different ids never wait on each other. A queue is dropped from the map
//! as soon as nobody holds or waits on it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::Mutex;
use tracing::trace;

type Queue = Arc<Mutex<()>>;

/// Serialises apply and restore per target connection.
#[derive(Debug, Default, Clone)]
pub struct MigrationLock {
    queues: Arc<StdMutex<HashMap<String, Queue>>>,
}

impl MigrationLock {
    /// Creates a lock with no queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` once every earlier caller for `target_id` has finished.
    ///
    /// The predecessor's outcome does not matter; a failed operation
    /// releases the queue exactly like a successful one.
    pub async fn with_lock<F, Fut, T>(&self, target_id: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let queue = self.enqueue(target_id);
        let output = {
            let _guard = queue.lock().await;
            trace!(target_id, "Acquired migration lock");
            f().await
        };
        drop(queue);
        self.release(target_id);
        output
    }

    /// Number of target ids with a live queue.
    #[must_use]
    pub fn active_targets(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn enqueue(&self, target_id: &str) -> Queue {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(queues.entry(target_id.to_string()).or_default())
    }

    /// Drops the queue for `target_id` if only the map still references it.
    fn release(&self, target_id: &str) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        if queues
            .get(target_id)
            .is_some_and(|q| Arc::strong_count(q) == 1)
        {
            queues.remove(target_id);
            trace!(target_id, "Released idle migration queue");
        }
    }
}
