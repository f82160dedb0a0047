mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{controller, templates, wait_until, RecordingEventHandler, ScriptedMailer};
use emailworker::events::{EventHandler, JobEvent, NoOpEventHandler};
use emailworker::jobs::{
    enqueue, Consumer, EmailJob, JobOutcome, MemoryQueue, QueueConfig, QueueError,
    QueueProvider, RetryController, RetryPolicy, WorkerPool,
};
use emailworker::mail::{Email, MailError, Mailer, StaticTemplates, TemplateRenderer};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn queue_config() -> QueueConfig {
    QueueConfig {
        pop_timeout_secs: 1,
        reconnect_delay_secs: 1,
        ..QueueConfig::default()
    }
}

struct Harness {
    queue: MemoryQueue,
    mailer: Arc<ScriptedMailer>,
    events: Arc<RecordingEventHandler>,
    cancel: CancellationToken,
    pool: WorkerPool,
    consumer: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(workers: usize, mailer: ScriptedMailer, policy: RetryPolicy) -> Self {
        let queue = MemoryQueue::new();
        let mailer = Arc::new(mailer);
        let events = Arc::new(RecordingEventHandler::default());
        let cancel = CancellationToken::new();

        let controller = controller(mailer.clone(), policy, events.clone());
        let mut pool = WorkerPool::new(workers, controller, cancel.clone());
        pool.spawn_workers();

        let consumer = Consumer::new(
            queue.clone(),
            pool.dispatcher(),
            &queue_config(),
            events.clone(),
            cancel.clone(),
        );
        let consumer = tokio::spawn(consumer.run());

        Self {
            queue,
            mailer,
            events,
            cancel,
            pool,
            consumer,
        }
    }

    fn sent_count(&self) -> usize {
        self.events
            .events()
            .iter()
            .filter(|e| matches!(e, JobEvent::Sent { .. }))
            .count()
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.pool
            .shutdown_graceful(Duration::from_secs(30))
            .await
            .unwrap();
        self.consumer.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn forgot_job_is_rendered_and_sent() {
    let harness = Harness::start(2, ScriptedMailer::new(), RetryPolicy::default());
    let mut queue = harness.queue.clone();

    queue
        .push(r#"{"purpose":"forgot","email":"a@b.com","replacements":{"CERTURL":"https://example.com"}}"#)
        .await
        .unwrap();

    wait_until(|| harness.sent_count() == 1).await;

    assert_eq!(
        harness.mailer.sent(),
        vec![Email::html(
            "a@b.com",
            "Recover your certificate",
            "Click https://example.com"
        )]
    );
    assert!(harness.events.events().contains(&JobEvent::Sent {
        recipient: "a@b.com".into(),
        purpose: "forgot".into(),
        attempts: 1,
    }));

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn every_job_is_processed_once_within_pool_size() {
    let mailer = ScriptedMailer::new().with_delay(Duration::from_millis(100));
    let harness = Harness::start(3, mailer, RetryPolicy::default());
    let mut queue = harness.queue.clone();

    for n in 0..12 {
        let job = EmailJob::new("delete", format!("user{n}@example.com"))
            .replace("CERTCODE", n.to_string());
        enqueue(&mut queue, &job).await.unwrap();
    }

    wait_until(|| harness.sent_count() == 12).await;

    let sent = harness.mailer.sent();
    let recipients: HashSet<_> = sent.iter().map(|email| email.to.clone()).collect();
    assert_eq!(sent.len(), 12);
    assert_eq!(recipients.len(), 12);
    assert_eq!(harness.mailer.attempts(), 12);
    assert!(harness.mailer.max_in_flight() <= 3);
    assert!(queue.is_empty().await);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn busy_workers_leave_jobs_in_the_broker() {
    let mailer = ScriptedMailer::new().with_delay(Duration::from_secs(60));
    let harness = Harness::start(1, mailer, RetryPolicy::default());
    let mut queue = harness.queue.clone();

    for n in 0..3 {
        enqueue(&mut queue, &EmailJob::new("delete", format!("user{n}@example.com")))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.mailer.attempts(), 1);
    assert_eq!(queue.len().await, 2);

    wait_until(|| harness.sent_count() == 3).await;
    assert!(queue.is_empty().await);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn poison_payload_is_dropped_and_consumption_continues() {
    let harness = Harness::start(1, ScriptedMailer::new(), RetryPolicy::default());
    let mut queue = harness.queue.clone();

    queue.push("not json").await.unwrap();
    queue.push(r#"{"purpose":"create"}"#).await.unwrap();
    enqueue(&mut queue, &EmailJob::new("create", "a@b.com").replace("CERTCODE", "1234"))
        .await
        .unwrap();

    wait_until(|| harness.sent_count() == 1).await;

    let rejected = harness
        .events
        .events()
        .iter()
        .filter(|e| matches!(e, JobEvent::Rejected { .. }))
        .count();
    assert_eq!(rejected, 2);
    assert_eq!(harness.mailer.sent().len(), 1);
    assert!(queue.is_empty().await);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn bounded_policy_gives_up_after_six_attempts() {
    let mailer = Arc::new(ScriptedMailer::always_failing());
    let events = Arc::new(RecordingEventHandler::default());
    let controller = controller(mailer.clone(), RetryPolicy::default(), events.clone());

    let started = Instant::now();
    let outcome = controller
        .run(EmailJob::new("delete", "a@b.com"), &CancellationToken::new())
        .await;

    assert_eq!(outcome, JobOutcome::GaveUp { attempts: 6 });
    assert_eq!(mailer.attempts(), 6);
    assert_eq!(started.elapsed(), Duration::from_secs(25));

    let retries: Vec<_> = events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            JobEvent::AttemptFailed { retry_in, .. } => Some(retry_in),
            _ => None,
        })
        .collect();
    assert_eq!(retries.len(), 6);
    assert!(retries[..5].iter().all(|r| *r == Some(Duration::from_secs(5))));
    assert_eq!(retries[5], None);
    assert_eq!(
        events.events().last(),
        Some(&JobEvent::GaveUp {
            recipient: "a@b.com".into(),
            attempts: 6,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn unbounded_policy_retries_until_sent() {
    let mailer = Arc::new(ScriptedMailer::failing(20));
    let events = Arc::new(RecordingEventHandler::default());
    let policy = RetryPolicy::unbounded(Duration::from_secs(5));
    let controller = controller(mailer.clone(), policy, events);

    let outcome = controller
        .run(EmailJob::new("delete", "a@b.com"), &CancellationToken::new())
        .await;

    assert_eq!(outcome, JobOutcome::Sent { attempts: 21 });
    assert_eq!(mailer.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn zero_retries_means_one_attempt() {
    let mailer = Arc::new(ScriptedMailer::always_failing());
    let events = Arc::new(RecordingEventHandler::default());
    let policy = RetryPolicy::bounded(0, Duration::from_secs(5));
    let controller = controller(mailer.clone(), policy, events);

    let outcome = controller
        .run(EmailJob::new("delete", "a@b.com"), &CancellationToken::new())
        .await;

    assert_eq!(outcome, JobOutcome::GaveUp { attempts: 1 });
    assert_eq!(mailer.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_purpose_is_never_sent() {
    let mailer = Arc::new(ScriptedMailer::new());
    let events = Arc::new(RecordingEventHandler::default());
    let controller = controller(mailer.clone(), RetryPolicy::default(), events.clone());

    let outcome = controller
        .run(EmailJob::new("unknown", "a@b.com"), &CancellationToken::new())
        .await;

    assert_eq!(outcome, JobOutcome::InvalidPurpose);
    assert_eq!(mailer.attempts(), 0);
    assert_eq!(
        events.events(),
        vec![JobEvent::InvalidPurpose {
            recipient: "a@b.com".into(),
            purpose: "unknown".into(),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn missing_template_uses_up_the_retry_budget() {
    let mailer = Arc::new(ScriptedMailer::new());
    let events = Arc::new(RecordingEventHandler::default());
    let controller = RetryController::new(
        TemplateRenderer::new(StaticTemplates::new()),
        mailer.clone(),
        RetryPolicy::bounded(2, Duration::from_secs(1)),
        events.clone(),
    );

    let outcome = controller
        .run(EmailJob::new("forgot", "a@b.com"), &CancellationToken::new())
        .await;

    assert_eq!(outcome, JobOutcome::GaveUp { attempts: 3 });
    assert_eq!(mailer.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_abandons_a_pending_retry() {
    let mailer = Arc::new(ScriptedMailer::always_failing());
    let events = Arc::new(RecordingEventHandler::default());
    let controller = Arc::new(controller(mailer.clone(), RetryPolicy::default(), events.clone()));
    let cancel = CancellationToken::new();

    let run = tokio::spawn({
        let controller = controller.clone();
        let cancel = cancel.clone();
        async move {
            controller
                .run(EmailJob::new("delete", "a@b.com"), &cancel)
                .await
        }
    });

    wait_until(|| mailer.attempts() == 1).await;
    cancel.cancel();

    assert_eq!(run.await.unwrap(), JobOutcome::Abandoned { attempts: 1 });
    assert_eq!(
        events.events().last(),
        Some(&JobEvent::Abandoned {
            recipient: "a@b.com".into(),
            attempts: 1,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn idle_pool_shuts_down_cleanly() {
    let events: Arc<dyn EventHandler> = Arc::new(NoOpEventHandler);
    let cancel = CancellationToken::new();
    let controller = RetryController::new(
        TemplateRenderer::new(templates()),
        Arc::new(ScriptedMailer::new()),
        RetryPolicy::default(),
        events.clone(),
    );

    let mut pool = WorkerPool::new(4, controller, cancel.clone());
    pool.spawn_workers();
    pool.spawn_workers();
    assert_eq!(pool.size(), 4);
    assert!(pool.has_active_workers());

    let consumer = Consumer::new(
        MemoryQueue::new(),
        pool.dispatcher(),
        &queue_config(),
        events,
        cancel.clone(),
    );
    let consumer = tokio::spawn(consumer.run());

    cancel.cancel();
    pool.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
    consumer.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn zero_sized_pool_still_has_a_worker() {
    let cancel = CancellationToken::new();
    let controller = controller(
        Arc::new(ScriptedMailer::new()),
        RetryPolicy::default(),
        Arc::new(RecordingEventHandler::default()),
    );

    let pool = WorkerPool::new(0, controller, cancel);
    assert_eq!(pool.size(), 1);
}

/// Fails the first `failures` pops, then serves its payloads.
struct FlakyQueue {
    failures: u32,
    payloads: Vec<String>,
    pops: Arc<std::sync::Mutex<Vec<Instant>>>,
}

#[async_trait]
impl QueueProvider for FlakyQueue {
    async fn push(&mut self, payload: &str) -> Result<(), QueueError> {
        self.payloads.push(payload.to_string());
        Ok(())
    }

    async fn pop(&mut self, timeout: Duration) -> Result<Option<String>, QueueError> {
        self.pops.lock().unwrap().push(Instant::now());

        if self.failures > 0 {
            self.failures -= 1;
            let down = redis::RedisError::from((redis::ErrorKind::IoError, "connection reset"));
            return Err(down.into());
        }
        if self.payloads.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }
        Ok(Some(self.payloads.remove(0)))
    }
}

#[tokio::test(start_paused = true)]
async fn consumer_waits_out_broker_errors_and_keeps_polling() {
    let mailer = Arc::new(ScriptedMailer::new());
    let events = Arc::new(RecordingEventHandler::default());
    let cancel = CancellationToken::new();

    let mut pool = WorkerPool::new(
        1,
        controller(mailer.clone(), RetryPolicy::default(), events.clone()),
        cancel.clone(),
    );
    pool.spawn_workers();

    let pops = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut queue = FlakyQueue {
        failures: 2,
        payloads: Vec::new(),
        pops: pops.clone(),
    };
    enqueue(&mut queue, &EmailJob::new("delete", "a@b.com").replace("CERTCODE", "99"))
        .await
        .unwrap();

    let consumer = Consumer::new(queue, pool.dispatcher(), &queue_config(), events, cancel.clone());
    let consumer = tokio::spawn(consumer.run());

    wait_until(|| mailer.sent().len() == 1).await;

    let pops = pops.lock().unwrap().clone();
    assert!(pops.len() >= 3);
    assert_eq!(pops[1] - pops[0], Duration::from_secs(1));
    assert_eq!(pops[2] - pops[1], Duration::from_secs(1));
    assert_eq!(mailer.sent()[0].to, "a@b.com");

    cancel.cancel();
    pool.shutdown_graceful(Duration::from_secs(30)).await.unwrap();
    consumer.await.unwrap();
}

/// Panics for recipients starting with `panic`, delegates otherwise.
#[derive(Debug, Default)]
struct PanickyMailer {
    inner: ScriptedMailer,
}

#[async_trait]
impl Mailer for PanickyMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        if email.to.starts_with("panic") {
            panic!("mailer blew up");
        }
        self.inner.send(email).await
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_job_does_not_take_down_its_worker() {
    let mailer = Arc::new(PanickyMailer::default());
    let events = Arc::new(RecordingEventHandler::default());
    let cancel = CancellationToken::new();

    let controller = RetryController::new(
        TemplateRenderer::new(templates()),
        mailer.clone(),
        RetryPolicy::default(),
        events.clone(),
    );
    let mut pool = WorkerPool::new(1, controller, cancel.clone());
    pool.spawn_workers();

    let mut queue = MemoryQueue::new();
    enqueue(&mut queue, &EmailJob::new("delete", "panic@b.com")).await.unwrap();
    enqueue(&mut queue, &EmailJob::new("delete", "ok@b.com")).await.unwrap();

    let consumer = Consumer::new(
        queue.clone(),
        pool.dispatcher(),
        &queue_config(),
        events,
        cancel.clone(),
    );
    let consumer = tokio::spawn(consumer.run());

    wait_until(|| mailer.inner.sent().len() == 1).await;

    assert_eq!(mailer.inner.sent()[0].to, "ok@b.com");
    assert!(pool.has_active_workers());

    cancel.cancel();
    pool.shutdown_graceful(Duration::from_secs(30)).await.unwrap();
    consumer.await.unwrap();
}
