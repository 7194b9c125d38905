//! Bounded pool for blocking controller calls.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::controller::Controller;

/// Errors from running a job on the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool closed")]
    Closed,

    #[error("worker panicked")]
    Panicked,
}

/// Runs blocking jobs off the event loop, at most `size` at a time.
///
/// A job keeps its permit until the blocking call returns, even if the task
/// awaiting it is cancelled.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers not currently running a job.
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `job` on a blocking thread once a worker is free.
    pub async fn run<F, T>(&self, job: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| {
            if e.is_panic() {
                PoolError::Panicked
            } else {
                PoolError::Closed
            }
        })
    }

    /// Run a blocking call against one controller.
    ///
    /// Calls for the same controller wait their turn before taking a
    /// worker, so a hung controller ties up at most one.
    pub async fn run_on<F, T>(&self, controller: &Arc<Controller>, call: F) -> Result<T, PoolError>
    where
        F: FnOnce(&Controller) -> T + Send + 'static,
        T: Send + 'static,
    {
        let _turn = controller.wait_turn().await;
        let controller = controller.clone();
        self.run(move || call(controller.as_ref())).await
    }
}
