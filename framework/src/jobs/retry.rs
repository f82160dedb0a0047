//! Per-job retry loop.
//!
//! Each job moves through `Resolve → Attempt → {Sent, Retry, GaveUp, InvalidPurpose}`:
//! the purpose is resolved to a template once, then render + send is attempted
//! until it succeeds or the [`RetryPolicy`] runs out. Every failure is caught
//! and turned into a state transition; nothing here panics the worker.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::EmailJob;
use crate::events::{EventHandler, JobEvent};
use crate::mail::{template_for_purpose, Email, MailError, Mailer, TemplateError, TemplateRenderer};

/// How failed attempts are retried.
///
/// `max_retries: None` retries forever; `Some(n)` allows `n` retries, i.e.
/// `n + 1` attempts in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: Option<u32>,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(5, Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn bounded(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries: Some(max_retries),
            delay,
        }
    }

    pub fn unbounded(delay: Duration) -> Self {
        Self {
            max_retries: None,
            delay,
        }
    }

    /// Whether another attempt is allowed after `retries_used` retries.
    pub fn allows_retry(&self, retries_used: u32) -> bool {
        self.max_retries.map_or(true, |max| retries_used < max)
    }
}

/// Why a single attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("template error: {0}")]
    Template(#[from] TemplateError),
    #[error("send error: {0}")]
    Send(#[from] MailError),
}

/// Terminal state of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Sent { attempts: u32 },
    GaveUp { attempts: u32 },
    InvalidPurpose,
    Abandoned { attempts: u32 },
}

/// Runs jobs to a terminal [`JobOutcome`].
///
/// Shared by every worker in the pool.
pub struct RetryController {
    templates: TemplateRenderer,
    mailer: Arc<dyn Mailer>,
    policy: RetryPolicy,
    events: Arc<dyn EventHandler>,
}

impl RetryController {
    pub fn new(
        templates: TemplateRenderer,
        mailer: Arc<dyn Mailer>,
        policy: RetryPolicy,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            templates,
            mailer,
            policy,
            events,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Process one job until it is sent, given up on, or interrupted.
    ///
    /// `cancel` only interrupts the delay between attempts; an attempt that has
    /// started always runs to completion.
    pub async fn run(&self, job: EmailJob, cancel: &CancellationToken) -> JobOutcome {
        let Some(template) = template_for_purpose(&job.purpose) else {
            self.events
                .handle_event(JobEvent::InvalidPurpose {
                    recipient: job.recipient,
                    purpose: job.purpose,
                })
                .await;
            return JobOutcome::InvalidPurpose;
        };

        let mut retries: u32 = 0;
        loop {
            let attempt = retries.saturating_add(1);

            let error = match self.attempt(&job, template).await {
                Ok(()) => {
                    self.events
                        .handle_event(JobEvent::Sent {
                            recipient: job.recipient,
                            purpose: job.purpose,
                            attempts: attempt,
                        })
                        .await;
                    return JobOutcome::Sent { attempts: attempt };
                }
                Err(e) => e,
            };

            let retry_in = self.policy.allows_retry(retries).then_some(self.policy.delay);
            self.events
                .handle_event(JobEvent::AttemptFailed {
                    recipient: job.recipient.clone(),
                    attempt,
                    error: error.to_string(),
                    retry_in,
                })
                .await;

            let Some(delay) = retry_in else {
                self.events
                    .handle_event(JobEvent::GaveUp {
                        recipient: job.recipient,
                        attempts: attempt,
                    })
                    .await;
                return JobOutcome::GaveUp { attempts: attempt };
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.abandon(job, attempt).await,
                _ = tokio::time::sleep(delay) => {}
            }

            retries = attempt;
        }
    }

    async fn attempt(&self, job: &EmailJob, template: &str) -> Result<(), AttemptError> {
        let rendered = self.templates.render(template, &job.replacements).await?;
        let email = Email::html(&job.recipient, rendered.subject, rendered.body);
        self.mailer.send(&email).await?;
        Ok(())
    }

    async fn abandon(&self, job: EmailJob, attempts: u32) -> JobOutcome {
        self.events
            .handle_event(JobEvent::Abandoned {
                recipient: job.recipient,
                attempts,
            })
            .await;
        JobOutcome::Abandoned { attempts }
    }
}
