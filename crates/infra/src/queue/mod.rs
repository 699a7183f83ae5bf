//! Job queue boundary.
//!
//! The broker gives at-least-once delivery with a visibility window: a
//! received message stays invisible to other consumers until it is deleted or
//! its visibility timeout lapses, after which it is redelivered. That window is
//! the only coordination between worker instances.
//!
//! Backends:
//! - `RedisStreamsQueue` (feature `redis`): consumer group on a Redis stream
//! - [`InMemoryQueue`]: same visibility semantics in-process (tests/dev)
//! - [`DisabledQueue`]: constructed when no broker is configured; every call fails

pub mod disabled;
pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use disabled::DisabledQueue;
pub use in_memory::InMemoryQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsQueue;
pub use worker::{Processed, QueueWorker, WorkerHandle, WorkerSettings, WorkerStats};

/// A received, not yet deleted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Broker-assigned id, also the receipt used to delete the message.
    pub id: String,
    pub body: Vec<u8>,
    /// How many times the broker has handed this message out, this time included.
    pub delivery_count: u32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue is disabled: no broker configured")]
    Disabled,

    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a message body; returns the broker message id.
    async fn send(&self, body: &[u8]) -> Result<String, QueueError>;

    /// Receive up to `max` messages, waiting up to `wait` when none are ready.
    /// An empty batch is not an error.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge and remove a message so it is never redelivered.
    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Park a poison message with its last error. Does not delete it.
    async fn dead_letter(&self, message: &QueueMessage, error: &str) -> Result<(), QueueError>;

    fn is_enabled(&self) -> bool {
        true
    }
}

#[async_trait]
impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    async fn send(&self, body: &[u8]) -> Result<String, QueueError> {
        (**self).send(body).await
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        (**self).receive(max, wait).await
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        (**self).delete(message).await
    }

    async fn dead_letter(&self, message: &QueueMessage, error: &str) -> Result<(), QueueError> {
        (**self).dead_letter(message, error).await
    }

    fn is_enabled(&self) -> bool {
        (**self).is_enabled()
    }
}
