use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::traits::QueueProvider;
use super::QueueError;

/// In-memory [`QueueProvider`] for development and testing.
///
/// Payloads are stored in a `VecDeque` behind a mutex. Not durable: all jobs
/// are lost on restart. Clones share the same queue, so a test can keep one
/// handle for pushing while a consumer owns another.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    entries: Arc<Mutex<VecDeque<String>>>,
    pushed: Arc<Notify>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl QueueProvider for MemoryQueue {
    async fn push(&mut self, payload: &str) -> Result<(), QueueError> {
        self.entries.lock().await.push_back(payload.to_string());
        self.pushed.notify_one();
        Ok(())
    }

    async fn pop(&mut self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking so a concurrent push is not missed.
            let pushed = self.pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            if let Some(payload) = self.entries.lock().await.pop_front() {
                return Ok(Some(payload));
            }

            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }
}
