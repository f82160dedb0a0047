//! Fixed-size worker pool fed through a rendezvous-style channel.
//!
//! Workers announce themselves as idle on a semaphore before waiting on the
//! shared job channel. The [`Dispatcher`] takes one of those permits before the
//! consumer pulls anything from the broker, so a job only leaves the broker
//! once a worker is ready for it and dequeuing pauses while all workers are busy.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{error, info, warn, Instrument};

use super::retry::{RetryController, RetryPolicy};
use super::{EmailJob, JobError};
use crate::config::lenient;

/// Worker pool and retry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Number of workers. Unset, zero, or invalid falls back to the host's
    /// available parallelism.
    #[serde(default, deserialize_with = "lenient")]
    pub workers: Option<usize>,

    /// Retries per job after the first attempt (default: 5). `unbounded`
    /// retries until the email is sent.
    #[serde(default = "default_max_retries", deserialize_with = "retry_limit")]
    pub max_retries: Option<u32>,

    /// Seconds between attempts (default: 5).
    #[serde(rename = "retry_delay", default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Seconds to wait for workers on shutdown (default: 30).
    #[serde(rename = "shutdown_timeout", default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_max_retries() -> Option<u32> {
    Some(5)
}

fn default_retry_delay() -> u64 {
    5
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn retry_limit<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }

    let raw = match Option::<Raw>::deserialize(deserializer)? {
        None => return Ok(default_max_retries()),
        Some(Raw::Int(n)) => n.to_string(),
        Some(Raw::Str(s)) => s.trim().to_ascii_lowercase(),
    };

    Ok(match raw.as_str() {
        "unbounded" | "infinite" | "none" => None,
        value => match value.parse() {
            Ok(n) => Some(n),
            Err(_) => {
                warn!(value, "invalid MAX_RETRIES, using the default");
                default_max_retries()
            }
        },
    })
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl PoolConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.filter(|n| *n > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: Duration::from_secs(self.retry_delay_secs),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Input side of a [`WorkerPool`].
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<EmailJob>,
    idle: Arc<Semaphore>,
}

impl Dispatcher {
    /// Wait until a worker is idle and reserve it.
    ///
    /// Fails with [`JobError::PoolClosed`] once the pool is shutting down.
    pub async fn ready(&self) -> Result<DispatchSlot<'_>, JobError> {
        self.idle
            .acquire()
            .await
            .map_err(|_| JobError::PoolClosed)?
            .forget();
        Ok(DispatchSlot { tx: &self.tx })
    }
}

/// A reserved idle worker. Dropping the slot without dispatching leaks the
/// reservation, so only do so when the pool is going away.
pub struct DispatchSlot<'a> {
    tx: &'a mpsc::Sender<EmailJob>,
}

impl DispatchSlot<'_> {
    /// Hand the job to the reserved worker.
    pub async fn dispatch(self, job: EmailJob) -> Result<(), JobError> {
        self.tx.send(job).await.map_err(|_| JobError::PoolClosed)
    }
}

/// Fixed set of workers sharing one job channel.
///
/// Each worker runs one job at a time through the [`RetryController`], so at
/// most `size` jobs are in progress at any instant and every job is received by
/// exactly one worker. Jobs run in their own task; a panic ends that job and
/// the worker carries on.
pub struct WorkerPool {
    size: usize,
    controller: Arc<RetryController>,
    cancel: CancellationToken,
    dispatcher: Dispatcher,
    jobs: Arc<Mutex<mpsc::Receiver<EmailJob>>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize, controller: RetryController, cancel: CancellationToken) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel(size);

        Self {
            size,
            controller: Arc::new(controller),
            cancel,
            dispatcher: Dispatcher {
                tx,
                idle: Arc::new(Semaphore::new(0)),
            },
            jobs: Arc::new(Mutex::new(rx)),
            handles: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// A handle for feeding jobs to the workers.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Spawn all workers. Calling it again is a no-op.
    pub fn spawn_workers(&mut self) {
        if !self.handles.is_empty() {
            return;
        }

        info!(workers = self.size, "spawning email workers");

        for worker_id in 0..self.size {
            let jobs = self.jobs.clone();
            let idle = self.dispatcher.idle.clone();
            let controller = self.controller.clone();
            let cancel = self.cancel.clone();

            let handle = tokio::spawn(
                run_worker(worker_id, jobs, idle, controller, cancel)
                    .instrument(tracing::info_span!("worker", worker_id)),
            );
            self.handles.push(handle);
        }
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Stop the pool and wait for the workers.
    ///
    /// Cancels the token (pending retry delays end and their jobs are
    /// abandoned), refuses new reservations, and closes this pool's side of the
    /// channel. Jobs already handed over still get their current attempt.
    /// Workers exit once every [`Dispatcher`] clone is gone and the channel is
    /// drained; whatever is still running after `timeout` is aborted.
    pub async fn shutdown_graceful(self, timeout: Duration) -> Result<(), JobError> {
        let Self {
            cancel,
            dispatcher,
            mut handles,
            ..
        } = self;

        info!(
            workers = handles.len(),
            timeout_secs = timeout.as_secs_f64(),
            "initiating graceful worker shutdown"
        );

        cancel.cancel();
        dispatcher.idle.close();
        drop(dispatcher);

        match tokio::time::timeout(timeout, join_workers(&mut handles)).await {
            Ok(()) => {
                info!("worker pool shutdown completed");
                Ok(())
            }
            Err(_elapsed) => {
                error!(
                    timeout_secs = timeout.as_secs_f64(),
                    "worker shutdown timed out, aborting remaining workers"
                );
                for handle in &handles {
                    handle.abort();
                }
                Err(JobError::ShutdownTimeout(timeout))
            }
        }
    }
}

async fn join_workers(handles: &mut [JoinHandle<()>]) {
    for (worker_id, handle) in handles.iter_mut().enumerate() {
        if let Err(e) = handle.await {
            error!(worker_id, error = %e, "worker task panicked");
        }
    }
}

async fn run_worker(
    worker_id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<EmailJob>>>,
    idle: Arc<Semaphore>,
    controller: Arc<RetryController>,
    cancel: CancellationToken,
) {
    loop {
        idle.add_permits(1);

        let next = jobs.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };

        let span = tracing::info_span!("job", recipient = %job.recipient, purpose = %job.purpose);
        let controller = controller.clone();
        let cancel = cancel.clone();
        let run = AbortOnDropHandle::new(tokio::spawn(
            async move {
                controller.run(job, &cancel).await;
            }
            .instrument(span),
        ));

        // A panicking mailer or template source only loses its own job.
        if let Err(e) = run.await {
            error!(worker_id, error = %e, "job task failed");
        }
    }

    info!(worker_id, "worker stopped");
}
