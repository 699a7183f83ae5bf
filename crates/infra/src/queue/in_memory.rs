use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{JobQueue, QueueError, QueueMessage};

#[derive(Debug)]
struct Entry {
    id: String,
    body: Vec<u8>,
    delivery_count: u32,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    entries: VecDeque<Entry>,
    dead_letters: Vec<(QueueMessage, String)>,
}

/// In-process queue with broker-like visibility timeouts.
///
/// Intended for tests/dev. A received message is hidden for `visibility` and
/// handed out again (with a higher delivery count) unless deleted first.
#[derive(Debug)]
pub struct InMemoryQueue {
    visibility: Duration,
    state: Mutex<State>,
    arrivals: Notify,
}

impl InMemoryQueue {
    pub fn new(visibility: Duration) -> Self {
        Self {
            visibility,
            state: Mutex::new(State::default()),
            arrivals: Notify::new(),
        }
    }

    /// Messages not yet deleted, visible or not.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn dead_letters(&self) -> Vec<(QueueMessage, String)> {
        self.state.lock().await.dead_letters.clone()
    }

    async fn take_visible(&self, max: usize) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let mut batch = Vec::new();
        for entry in state.entries.iter_mut() {
            if batch.len() >= max {
                break;
            }
            if entry.visible_at <= now {
                entry.delivery_count += 1;
                entry.visible_at = now + self.visibility;
                batch.push(QueueMessage {
                    id: entry.id.clone(),
                    body: entry.body.clone(),
                    delivery_count: entry.delivery_count,
                });
            }
        }
        batch
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn send(&self, body: &[u8]) -> Result<String, QueueError> {
        let id = {
            let mut state = self.state.lock().await;
            state.next_id += 1;
            let id = format!("mem-{}", state.next_id);
            state.entries.push_back(Entry {
                id: id.clone(),
                body: body.to_vec(),
                delivery_count: 0,
                visible_at: Instant::now(),
            });
            id
        };
        self.arrivals.notify_waiters();
        Ok(id)
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        let batch = self.take_visible(max).await;
        if !batch.is_empty() || wait.is_zero() {
            return Ok(batch);
        }

        // Block until something is sent or the wait elapses, then look once more.
        let _ = tokio::time::timeout(wait, self.arrivals.notified()).await;
        Ok(self.take_visible(max).await)
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.state.lock().await.entries.retain(|e| e.id != message.id);
        Ok(())
    }

    async fn dead_letter(&self, message: &QueueMessage, error: &str) -> Result<(), QueueError> {
        self.state
            .lock()
            .await
            .dead_letters
            .push((message.clone(), error.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn undeleted_message_is_redelivered_after_visibility() {
        let queue = InMemoryQueue::new(Duration::from_secs(10));
        queue.send(b"job").await.unwrap();

        let first = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].delivery_count, 1);
        assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        let second = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn deleted_message_is_gone() {
        let queue = InMemoryQueue::default();
        queue.send(b"job").await.unwrap();
        let batch = queue.receive(1, Duration::ZERO).await.unwrap();
        queue.delete(&batch[0]).await.unwrap();
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_receive_waits_then_returns_nothing() {
        let queue = InMemoryQueue::default();
        let batch = queue.receive(5, Duration::from_millis(200)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn disabled_queue_refuses_everything() {
        let queue = super::super::DisabledQueue;
        assert!(!queue.is_enabled());
        assert!(matches!(queue.send(b"{}").await, Err(QueueError::Disabled)));
    }
}
