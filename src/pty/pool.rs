//! Bounded pool for blocking terminal work
//!
//! Terminal reads block a thread for the whole lifetime of a command. The
//! pool caps how many such jobs run at once so a burst of sessions cannot
//! exhaust the runtime's blocking threads.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Errors raised by the worker pool
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Worker pool is closed")]
    Closed,

    #[error("Worker task failed: {0}")]
    TaskFailed(String),
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Runs blocking closures with a fixed concurrency limit
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool allowing `size` concurrent jobs
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Maximum number of concurrent jobs
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of idle worker slots
    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `job` on a blocking thread once a worker slot is free
    ///
    /// The job keeps running to completion even if the returned future is
    /// dropped; its slot is released when it finishes.
    pub async fn run<F, T>(&self, job: F) -> PoolResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| PoolError::TaskFailed(e.to_string()))
    }

    /// Refuse new jobs; jobs already running are unaffected
    pub fn close(&self) {
        self.permits.close();
    }
}
