//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! - **Stream key**: `conreg:jobs` by default; each job is one entry with a `body` field
//! - **Consumer group**: all workers share one group, so each entry goes to one worker
//! - **Visibility**: an entry stays in the group's pending list until `delete`
//!   (XACK + XDEL). Entries pending longer than the visibility timeout are
//!   claimed by whichever worker asks next (XPENDING IDLE + XCLAIM), which is
//!   how a crashed or timed-out worker's jobs get redelivered.
//! - **Dead-letter stream**: `conreg:jobs:dlq`, written by the worker when a
//!   delivery cap is configured
//!
//! Requires Redis >= 6.2 (`XPENDING ... IDLE`).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::{Client, RedisError};
use tracing::{debug, instrument, warn};

use super::{JobQueue, QueueError, QueueMessage};
use crate::config::QueueConfig;

const BODY_FIELD: &str = "body";

#[derive(Clone)]
pub struct RedisStreamsQueue {
    conn: ConnectionManager,
    stream_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
}

impl std::fmt::Debug for RedisStreamsQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsQueue")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

fn map_redis_error(operation: &str, err: RedisError) -> QueueError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
        QueueError::Connection(format!("{operation}: {err}"))
    } else {
        QueueError::Command(format!("{operation} failed: {err}"))
    }
}

impl RedisStreamsQueue {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(redis_url: &str, config: &QueueConfig) -> Result<Self, QueueError> {
        let client = Client::open(redis_url).map_err(|e| QueueError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| map_redis_error("connect", e))?;

        let queue = Self {
            conn,
            stream_key: config.stream.clone(),
            dlq_key: config.dead_letter_stream.clone(),
            group: config.consumer_group.clone(),
            consumer: config.consumer_name.clone(),
            visibility_timeout: config.visibility_timeout,
        };
        queue.ensure_consumer_group().await?;
        Ok(queue)
    }

    /// XGROUP CREATE ... MKSTREAM; an existing group is fine.
    async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error("XGROUP CREATE", e)),
        }
    }

    fn visibility_ms(&self) -> u64 {
        self.visibility_timeout.as_millis() as u64
    }

    /// Claim entries other consumers left pending past the visibility timeout.
    async fn reclaim_expired(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let mut conn = self.conn.clone();
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(self.visibility_ms())
            .arg("-")
            .arg("+")
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("XPENDING", e))?;

        if pending.ids.is_empty() {
            return Ok(vec![]);
        }

        let delivered: HashMap<String, usize> = pending
            .ids
            .iter()
            .map(|p| (p.id.clone(), p.times_delivered))
            .collect();
        let ids: Vec<&str> = pending.ids.iter().map(|p| p.id.as_str()).collect();

        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.visibility_ms())
            .arg(&ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("XCLAIM", e))?;

        let messages: Vec<_> = claimed
            .ids
            .into_iter()
            .map(|entry| {
                // XCLAIM counts as one more delivery.
                let previous = delivered.get(&entry.id).copied().unwrap_or(0);
                to_message(entry, previous as u32 + 1)
            })
            .collect();

        if !messages.is_empty() {
            debug!(count = messages.len(), "reclaimed expired pending jobs");
        }
        Ok(messages)
    }

    async fn read_new(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(max);
        if !wait.is_zero() {
            cmd.arg("BLOCK").arg(wait.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(">");

        // Nil reply when the block times out with nothing new.
        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("XREADGROUP", e))?;

        Ok(reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .map(|entry| to_message(entry, 1))
            .collect())
    }
}

fn to_message(entry: StreamId, delivery_count: u32) -> QueueMessage {
    // A missing body decodes as malformed and is dropped as permanent.
    let body = entry.get::<Vec<u8>>(BODY_FIELD).unwrap_or_default();
    QueueMessage {
        id: entry.id,
        body,
        delivery_count,
    }
}

#[async_trait]
impl JobQueue for RedisStreamsQueue {
    #[instrument(skip(self, body), fields(stream_key = %self.stream_key), err)]
    async fn send(&self, body: &[u8]) -> Result<String, QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("XADD", e))
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        let reclaimed = self.reclaim_expired(max).await?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }
        self.read_new(max, wait).await
    }

    #[instrument(skip(self, message), fields(message_id = %message.id), err)]
    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&message.id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(&message.id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("XACK/XDEL", e))
    }

    async fn dead_letter(&self, message: &QueueMessage, error: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_message_id")
            .arg(&message.id)
            .arg("delivery_count")
            .arg(message.delivery_count)
            .arg("error")
            .arg(error)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg(BODY_FIELD)
            .arg(&message.body)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("DLQ XADD", e))?;

        warn!(
            message_id = %message.id,
            delivery_count = message.delivery_count,
            "job sent to dead-letter stream"
        );
        Ok(())
    }
}
