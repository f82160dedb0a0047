//! Email job pipeline: broker consumption, worker pool, and per-job retry.
//!
//! # Architecture
//!
//! - [`EmailJob`]: The decoded unit of work (purpose, recipient, replacements).
//! - [`QueueProvider`]: Broker-agnostic blocking FIFO. [`RedisQueue`] talks to
//!   Redis (`LPUSH`/`BRPOP`); [`MemoryQueue`] is the in-process equivalent for
//!   development and testing.
//! - [`Consumer`]: Polls a `QueueProvider`, decodes payloads, and hands each job
//!   to an idle worker.
//! - [`WorkerPool`]: A fixed set of workers sharing one job channel.
//! - [`RetryController`]: Resolves a job's template, renders, sends, and
//!   retries with a fixed delay under a [`RetryPolicy`].
//!
//! ```text
//! Consumer ──▶ Dispatcher ──▶ [ worker 0 .. worker N ] ──▶ RetryController
//!                                                            ├─▶ TemplateRenderer
//!                                                            └─▶ Mailer
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! let cancel = CancellationToken::new();
//! let controller = RetryController::new(templates, mailer, config.pool.retry_policy(), events.clone());
//!
//! let mut pool = WorkerPool::new(config.pool.worker_count(), controller, cancel.clone());
//! pool.spawn_workers();
//!
//! let queue = RedisQueue::connect(&config.queue, &cancel).await?;
//! Consumer::new(queue, pool.dispatcher(), &config.queue, events, cancel.clone())
//!     .run()
//!     .await;
//!
//! pool.shutdown_graceful(config.pool.shutdown_timeout()).await?;
//! ```

mod consumer;
mod entry;
mod memory;
mod redis;
mod retry;
mod traits;
mod worker;

pub use consumer::Consumer;
pub use entry::EmailJob;
pub use memory::MemoryQueue;
pub use self::redis::{QueueConfig, RedisQueue};
pub use retry::{AttemptError, JobOutcome, RetryController, RetryPolicy};
pub use traits::QueueProvider;
pub use worker::{DispatchSlot, Dispatcher, PoolConfig, WorkerPool};

use std::time::Duration;

// -------------------------------------------------------------------------
// Errors
// -------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("invalid broker url: {0}")]
    InvalidUrl(#[source] ::redis::RedisError),
    #[error("broker error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("cancelled while waiting for the broker")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("malformed job payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("worker pool is closed")]
    PoolClosed,
    #[error("worker shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

// -------------------------------------------------------------------------
// Helpers
// -------------------------------------------------------------------------

/// Serialize a job and append it to the tail of the queue.
pub async fn enqueue<Q: QueueProvider>(queue: &mut Q, job: &EmailJob) -> Result<(), JobError> {
    let payload = serde_json::to_string(job)?;
    queue.push(&payload).await?;
    Ok(())
}
