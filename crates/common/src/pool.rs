//! Capability-token worker pools.
//!
//! Heavy work (GPU inference, sink IO) is submitted against a named resource
//! pool holding a fixed number of slots, e.g. one `GPU` token or one `IO`
//! token. A submission waits for a slot, runs, and releases the slot on
//! completion. Pools are process-wide: created at startup, closed at
//! shutdown, shared by reference.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

/// Errors from pool submission.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("worker pool '{0}' is shut down")]
    Closed(String),

    #[error("pooled task failed: {0}")]
    Task(String),
}

/// A fixed-slot pool identified by the resource it guards.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    resource: String,
    slots: usize,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool with `slots` tokens for `resource` (e.g. `"GPU"`, `"IO"`).
    #[must_use]
    pub fn new(resource: impl Into<String>, slots: usize) -> Self {
        let resource = resource.into();
        debug!(resource = %resource, slots, "creating worker pool");
        Self {
            resource,
            slots,
            semaphore: Arc::new(Semaphore::new(slots)),
        }
    }

    /// The resource this pool guards.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Total number of slots.
    #[must_use]
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Run blocking work on a pool slot.
    ///
    /// Waits for a token, executes `work` on the blocking thread pool, and
    /// releases the token when it finishes. Cancelling the returned future
    /// before a slot is granted abandons the submission; once running, the
    /// work completes in the background and its result is discarded.
    pub async fn submit<T, F>(&self, work: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed(self.resource.clone()))?;

        let handle = tokio::task::spawn_blocking(move || {
            let result = work();
            drop(permit);
            result
        });

        handle.await.map_err(|e| PoolError::Task(e.to_string()))
    }

    /// Run a future while holding a pool slot.
    pub async fn run<T, Fut>(&self, fut: Fut) -> Result<T, PoolError>
    where
        Fut: std::future::Future<Output = T>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| PoolError::Closed(self.resource.clone()))?;
        Ok(fut.await)
    }

    /// Close the pool; pending and future submissions fail with `Closed`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
