use std::time::Duration;

use async_trait::async_trait;

use super::{JobQueue, QueueError, QueueMessage};

/// Stand-in queue when no broker is configured.
///
/// Lets the HTTP API start (the synchronous internal job route needs no
/// broker) while enqueue requests fail with [`QueueError::Disabled`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledQueue;

#[async_trait]
impl JobQueue for DisabledQueue {
    async fn send(&self, _body: &[u8]) -> Result<String, QueueError> {
        Err(QueueError::Disabled)
    }

    async fn receive(&self, _max: usize, _wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        Err(QueueError::Disabled)
    }

    async fn delete(&self, _message: &QueueMessage) -> Result<(), QueueError> {
        Err(QueueError::Disabled)
    }

    async fn dead_letter(&self, _message: &QueueMessage, _error: &str) -> Result<(), QueueError> {
        Err(QueueError::Disabled)
    }

    fn is_enabled(&self) -> bool {
        false
    }
}
