//! Semaphore-bounded worker pool
//!
//! The dispatcher submits one future per job; at most `workers` run at a
//! time. `submit` blocks until a slot frees up and fails once the run token
//! is cancelled, so a cancelled run stops admitting work while in-flight
//! jobs finish their own teardown.

use crate::concurrency::ConcurrencyError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<()>,
    token: CancellationToken,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize, token: CancellationToken) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            tasks: JoinSet::new(),
            token,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Enqueue a job. Waits for a free worker slot; returns an error instead
    /// of enqueueing once the run token has been cancelled.
    pub async fn submit<F>(&mut self, job: F) -> Result<(), ConcurrencyError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = tokio::select! {
            _ = self.token.cancelled() => return Err(ConcurrencyError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| ConcurrencyError::Closed)?
            }
        };
        self.tasks.spawn(async move {
            job.await;
            drop(permit);
        });
        Ok(())
    }

    /// Wait for every submitted job; returns the number of jobs that
    /// panicked instead of completing.
    pub async fn join(&mut self) -> usize {
        let mut panicked = 0;
        while let Some(result) = self.tasks.join_next().await {
            if result.is_err() {
                panicked += 1;
            }
        }
        panicked
    }
}
