use std::sync::Arc;

use anyhow::{Context, Result};
use emailworker::events::{EventHandler, TracingEventHandler};
use emailworker::jobs::{Consumer, QueueError, RedisQueue, RetryController, WorkerPool};
use emailworker::mail::{FsTemplates, SmtpMailer, TemplateRenderer};
use emailworker::{shutdown, AppConfig};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("loading configuration")?;

    let cancel = CancellationToken::new();
    shutdown::cancel_on_shutdown(cancel.clone());

    let mailer = SmtpMailer::from_config(config.mailer.clone()).context("configuring SMTP")?;
    let templates = TemplateRenderer::new(FsTemplates::new(config.templates.dir.clone()));
    let events: Arc<dyn EventHandler> = Arc::new(TracingEventHandler);

    let queue = match RedisQueue::connect(&config.queue, &cancel).await {
        Ok(queue) => queue,
        Err(QueueError::Cancelled) => return Ok(()),
        Err(e) => return Err(e).context("connecting to redis"),
    };

    let policy = config.pool.retry_policy();
    match policy.max_retries {
        Some(retries) => {
            tracing::info!(retries, delay_secs = policy.delay.as_secs(), "bounded retries")
        }
        None => tracing::info!(delay_secs = policy.delay.as_secs(), "unbounded retries"),
    }

    let controller = RetryController::new(templates, Arc::new(mailer), policy, events.clone());
    let mut pool = WorkerPool::new(config.pool.worker_count(), controller, cancel.clone());
    pool.spawn_workers();

    let consumer = Consumer::new(queue, pool.dispatcher(), &config.queue, events, cancel.clone());
    tracing::info!(queue = %config.queue.queue_key, "email worker started");

    let consumer = tokio::spawn(consumer.run());
    cancel.cancelled().await;

    let stopped = pool.shutdown_graceful(config.pool.shutdown_timeout()).await;
    if stopped.is_err() {
        consumer.abort();
    }
    if let Err(e) = consumer.await {
        if !e.is_cancelled() {
            tracing::error!(error = %e, "consumer task failed");
        }
    }
    stopped.context("stopping workers")?;

    tracing::info!("email worker stopped");
    Ok(())
}
