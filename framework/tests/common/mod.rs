#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use emailworker::events::{EventHandler, JobEvent};
use emailworker::jobs::{RetryController, RetryPolicy};
use emailworker::mail::{Email, MailError, Mailer, StaticTemplates, TemplateRenderer};

/// Mailer that fails a fixed number of times before succeeding.
#[derive(Debug, Default)]
pub struct ScriptedMailer {
    failures_left: AtomicU32,
    delay: Duration,
    attempts: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    sent: Mutex<Vec<Email>>,
}

impl ScriptedMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(times),
            ..Self::default()
        }
    }

    pub fn always_failing() -> Self {
        Self::failing(u32::MAX)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for ScriptedMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                (left > 0).then(|| left.saturating_sub(1))
            })
            .is_ok();
        if failed {
            return Err(MailError::Transport("connection refused".into()));
        }

        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

/// Keeps every event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingEventHandler {
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: JobEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn templates() -> StaticTemplates {
    StaticTemplates::new()
        .with("create_cert", "Your certificate\nUse code =^CERTCODE^=")
        .with("delete_cert", "Certificate removal\nConfirm with =^CERTCODE^=")
        .with("forgot_cert", "Recover your certificate\nClick =^CERTURL^=")
}

pub fn controller(
    mailer: Arc<ScriptedMailer>,
    policy: RetryPolicy,
    events: Arc<RecordingEventHandler>,
) -> RetryController {
    RetryController::new(TemplateRenderer::new(templates()), mailer, policy, events)
}

/// Poll until `done` holds, letting the paused clock advance between checks.
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
