use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::redis::QueueConfig;
use super::traits::QueueProvider;
use super::worker::Dispatcher;
use super::{EmailJob, JobError};
use crate::events::{EventHandler, JobEvent};

/// Pulls payloads off a [`QueueProvider`] and hands decoded jobs to the pool.
///
/// The consumer reserves an idle worker before each pop, so nothing is taken
/// from the broker while every worker is busy. Malformed payloads are reported
/// and dropped; they are never pushed back.
pub struct Consumer<Q: QueueProvider> {
    queue: Q,
    dispatcher: Dispatcher,
    pop_timeout: Duration,
    error_delay: Duration,
    events: Arc<dyn EventHandler>,
    cancel: CancellationToken,
}

impl<Q: QueueProvider> Consumer<Q> {
    pub fn new(
        queue: Q,
        dispatcher: Dispatcher,
        config: &QueueConfig,
        events: Arc<dyn EventHandler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            pop_timeout: config.pop_timeout(),
            error_delay: config.reconnect_delay(),
            events,
            cancel,
        }
    }

    /// Wait up to the pop timeout for the next job.
    ///
    /// `Ok(None)` means the queue stayed empty; [`JobError::Decode`] means a
    /// payload was popped but could not be decoded and is gone.
    pub async fn next_job(&mut self) -> Result<Option<EmailJob>, JobError> {
        let Some(payload) = self.queue.pop(self.pop_timeout).await? else {
            return Ok(None);
        };
        tracing::debug!(%payload, "dequeued");
        EmailJob::decode(&payload).map(Some)
    }

    /// Consume until cancelled or the pool closes.
    ///
    /// Cancellation is checked between pops; a pop in progress finishes first
    /// so a job already taken from the broker is still dispatched.
    pub async fn run(mut self) {
        info!("email consumer is listening");
        let dispatcher = self.dispatcher.clone();

        'consume: loop {
            let slot = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                slot = dispatcher.ready() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            loop {
                if self.cancel.is_cancelled() {
                    break 'consume;
                }

                match self.next_job().await {
                    Ok(Some(job)) => {
                        if let Err(e) = slot.dispatch(job).await {
                            error!(error = %e, "worker pool closed with a job in hand");
                            break 'consume;
                        }
                        continue 'consume;
                    }
                    Ok(None) => {}
                    Err(JobError::Decode(e)) => {
                        self.events
                            .handle_event(JobEvent::Rejected {
                                error: e.to_string(),
                            })
                            .await;
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            retry_in_secs = self.error_delay.as_secs_f64(),
                            "can't get queue element"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => break 'consume,
                            _ = tokio::time::sleep(self.error_delay) => {}
                        }
                    }
                }
            }
        }

        info!("email consumer stopped");
    }
}
