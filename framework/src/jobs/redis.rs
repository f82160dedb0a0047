use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use serde::{Deserialize, Deserializer};
use tokio_util::sync::CancellationToken;

use super::traits::QueueProvider;
use super::QueueError;
use crate::config::lenient;

/// Broker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Redis connection URL (default: `redis://redis:6379`).
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// List key the jobs are pushed to (default: `email_jobs`).
    #[serde(rename = "email_queue", default = "default_queue_key")]
    pub queue_key: String,

    /// Seconds a single blocking pop waits (default: 10, also used for zero
    /// or unparseable values). Never 0, which would block `BRPOP` forever.
    #[serde(
        rename = "queue_timeout",
        default = "default_queue_timeout",
        deserialize_with = "queue_timeout_or_default"
    )]
    pub pop_timeout_secs: u64,

    /// Seconds between connection attempts (default: 5).
    #[serde(rename = "reconnect_delay", default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_redis_url() -> String {
    "redis://redis:6379".to_string()
}

fn default_queue_key() -> String {
    "email_jobs".to_string()
}

fn default_queue_timeout() -> u64 {
    10
}

fn queue_timeout_or_default<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let secs: Option<u64> = lenient(deserializer)?;
    Ok(secs.filter(|secs| *secs != 0).unwrap_or_else(default_queue_timeout))
}

fn default_reconnect_delay() -> u64 {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            queue_key: default_queue_key(),
            pop_timeout_secs: default_queue_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl QueueConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.pop_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Redis list used as a FIFO: producers `LPUSH`, the consumer `BRPOP`s.
pub struct RedisQueue {
    client: Client,
    conn: Option<MultiplexedConnection>,
    key: String,
}

impl RedisQueue {
    /// Connect and verify the broker with `PING`, retrying until it answers.
    ///
    /// Connection failures are logged and retried every
    /// [`reconnect_delay`](QueueConfig::reconnect_delay) for as long as it takes;
    /// the only ways out are success, an unparseable URL, or `cancel`.
    pub async fn connect(
        config: &QueueConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, QueueError> {
        let client = Client::open(config.redis_url.as_str()).map_err(QueueError::InvalidUrl)?;
        let mut queue = Self {
            client,
            conn: None,
            key: config.queue_key.clone(),
        };

        loop {
            match queue.connection().await {
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!(
                        addr = %config.redis_url,
                        error = %e,
                        retry_in_secs = config.reconnect_delay_secs,
                        "can't connect to redis"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                        _ = tokio::time::sleep(config.reconnect_delay()) => {}
                    }
                }
            }
        }

        tracing::info!(addr = %config.redis_url, queue = %queue.key, "connected to redis");
        Ok(queue)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The live connection, re-established (and pinged) if the last one failed.
    async fn connection(&mut self) -> Result<&mut MultiplexedConnection, QueueError> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let mut conn = self.client.get_multiplexed_async_connection().await?;
                redis::cmd("PING").query_async::<String>(&mut conn).await?;
                conn
            }
        };
        Ok(self.conn.insert(conn))
    }

    fn check<T>(&mut self, result: redis::RedisResult<T>) -> Result<T, QueueError> {
        result.map_err(|e| {
            if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                self.conn = None;
            }
            QueueError::Redis(e)
        })
    }
}

#[async_trait]
impl QueueProvider for RedisQueue {
    async fn push(&mut self, payload: &str) -> Result<(), QueueError> {
        let key = self.key.clone();
        let conn = self.connection().await?;
        let result = redis::cmd("LPUSH")
            .arg(&key)
            .arg(payload)
            .query_async::<i64>(conn)
            .await;
        self.check(result).map(|_| ())
    }

    async fn pop(&mut self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let key = self.key.clone();
        let conn = self.connection().await?;
        let result = redis::cmd("BRPOP")
            .arg(&key)
            .arg(timeout.as_secs_f64())
            .query_async::<Option<(String, String)>>(conn)
            .await;
        Ok(self.check(result)?.map(|(_key, payload)| payload))
    }
}
