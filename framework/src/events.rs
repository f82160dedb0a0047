//! Job lifecycle events.
//!
//! The consumer and the retry controller report what happened to each job as
//! [`JobEvent`] values instead of logging directly. The process installs
//! [`TracingEventHandler`], which turns them into structured log records;
//! tests install a handler that records them.

use std::time::Duration;

use async_trait::async_trait;

/// Something that happened to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// A payload could not be decoded and was dropped.
    Rejected { error: String },

    /// The job's purpose has no template; nothing was sent.
    InvalidPurpose { recipient: String, purpose: String },

    /// An attempt failed. `retry_in` is `None` when no retry follows.
    AttemptFailed {
        recipient: String,
        attempt: u32,
        error: String,
        retry_in: Option<Duration>,
    },

    /// The email was handed to the transport.
    Sent {
        recipient: String,
        purpose: String,
        attempts: u32,
    },

    /// The retry budget ran out and the job was dropped.
    GaveUp { recipient: String, attempts: u32 },

    /// Shutdown interrupted the job between attempts.
    Abandoned { recipient: String, attempts: u32 },
}

/// Receives job events.
#[async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    async fn handle_event(&self, event: JobEvent);
}

/// Writes each event as a `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventHandler;

#[async_trait]
impl EventHandler for TracingEventHandler {
    async fn handle_event(&self, event: JobEvent) {
        match event {
            JobEvent::Rejected { error } => {
                tracing::warn!(%error, "queue element is invalid, dropping it");
            }
            JobEvent::InvalidPurpose { recipient, purpose } => {
                tracing::error!(%recipient, %purpose, "invalid purpose, dropping job");
            }
            JobEvent::AttemptFailed {
                recipient,
                attempt,
                error,
                retry_in: Some(delay),
            } => {
                tracing::warn!(
                    %recipient,
                    attempt,
                    %error,
                    retry_in_secs = delay.as_secs_f64(),
                    "send failed, retrying"
                );
            }
            JobEvent::AttemptFailed {
                recipient,
                attempt,
                error,
                retry_in: None,
            } => {
                tracing::warn!(%recipient, attempt, %error, "send failed");
            }
            JobEvent::Sent {
                recipient,
                purpose,
                attempts,
            } => {
                tracing::info!(%recipient, %purpose, attempts, "email sent");
            }
            JobEvent::GaveUp {
                recipient,
                attempts,
            } => {
                tracing::error!(%recipient, attempts, "no retries left, skipping email");
            }
            JobEvent::Abandoned {
                recipient,
                attempts,
            } => {
                tracing::warn!(%recipient, attempts, "shutting down, abandoning email");
            }
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEventHandler;

#[async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: JobEvent) {}
}
