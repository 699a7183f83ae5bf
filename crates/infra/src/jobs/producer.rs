use thiserror::Error;
use tracing::{debug, instrument};

use super::error::JobError;
use super::message::JobAction;
use crate::queue::{JobQueue, QueueError};

#[derive(Debug, Error)]
pub enum ProduceError {
    /// The message would be rejected by the consumer.
    #[error(transparent)]
    Invalid(#[from] JobError),

    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Enqueues jobs in the exact shape the consumer decodes.
#[derive(Debug, Clone)]
pub struct JobProducer<Q> {
    queue: Q,
}

impl<Q: JobQueue> JobProducer<Q> {
    pub fn new(queue: Q) -> Self {
        Self { queue }
    }

    /// Validate a raw body with the consumer's decoder, then enqueue the
    /// canonical re-encoding. Returns the action and broker message id.
    pub async fn enqueue_payload(&self, payload: &[u8]) -> Result<(JobAction, String), ProduceError> {
        let action = JobAction::decode(payload)?;
        let id = self.enqueue(&action).await?;
        Ok((action, id))
    }

    #[instrument(skip(self, action), fields(action = action.name()), err)]
    pub async fn enqueue(&self, action: &JobAction) -> Result<String, ProduceError> {
        let body = action.encode()?;
        let id = self.queue.send(&body).await?;
        debug!(message_id = %id, "job enqueued");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use conreg_core::{TicketId, UserId};

    use crate::queue::{DisabledQueue, InMemoryQueue};

    #[tokio::test]
    async fn enqueued_body_decodes_to_same_action() {
        let queue = Arc::new(InMemoryQueue::default());
        let producer = JobProducer::new(queue.clone());
        let action = JobAction::Approve {
            ticket_id: TicketId::new(),
            staff_id: UserId::new(),
        };

        producer.enqueue(&action).await.unwrap();
        let received = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(JobAction::decode(&received[0].body).unwrap(), action);
    }

    #[tokio::test]
    async fn invalid_payload_is_not_enqueued() {
        let queue = Arc::new(InMemoryQueue::default());
        let producer = JobProducer::new(queue.clone());

        let err = producer
            .enqueue_payload(br#"{"action":"purchase","user_id":"x"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ProduceError::Invalid(_)));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn disabled_queue_surfaces_as_queue_error() {
        let producer = JobProducer::new(DisabledQueue);
        let err = producer
            .enqueue(&JobAction::Cancel { user_id: UserId::new() })
            .await
            .unwrap_err();
        assert!(matches!(err, ProduceError::Queue(QueueError::Disabled)));
    }
}
