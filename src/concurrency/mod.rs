//! Bounded worker pool for per-image jobs

pub mod pool;

pub use pool::WorkerPool;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConcurrencyError {
    /// The run context was cancelled before the job could be enqueued
    #[error("worker pool cancelled")]
    Cancelled,
    /// The pool's semaphore was closed
    #[error("worker pool closed")]
    Closed,
}
