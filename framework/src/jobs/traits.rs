use std::time::Duration;

use async_trait::async_trait;

use super::QueueError;

/// Broker-agnostic blocking FIFO of raw job payloads.
///
/// Implement this trait to plug in a broker. Delivery is at-least-once: a
/// payload returned by [`pop`](QueueProvider::pop) is owned by the caller and
/// is gone from the broker.
///
/// Methods take `&mut self` because a provider is owned by a single
/// [`Consumer`](super::Consumer).
#[async_trait]
pub trait QueueProvider: Send + 'static {
    /// Append a payload to the tail of the queue.
    async fn push(&mut self, payload: &str) -> Result<(), QueueError>;

    /// Block up to `timeout` for the payload at the head of the queue.
    ///
    /// Returns `Ok(None)` when the timeout elapses with nothing queued.
    async fn pop(&mut self, timeout: Duration) -> Result<Option<String>, QueueError>;
}
