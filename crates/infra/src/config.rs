//! Environment configuration, read once at startup.
//!
//! Every `from_lookup` takes the variable source as a function so tests can
//! pass a map instead of mutating the process environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::{info, warn};

use crate::jobs::Backoff;
use crate::queue::{DisabledQueue, JobQueue, QueueError, WorkerSettings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    /// A full batch could outlive its lease, so a second consumer would
    /// receive messages this one still holds.
    #[error(
        "JOB_RECEIVE_BATCH ({receive_batch}) x JOB_TIMEOUT_SECS ({job_timeout:?}) must be shorter than \
         JOB_VISIBILITY_TIMEOUT_SECS ({visibility_timeout:?})"
    )]
    VisibilityTooShort {
        receive_batch: usize,
        job_timeout: Duration,
        visibility_timeout: Duration,
    },
}

pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn optional(lookup: Lookup<'_>, name: &str) -> Option<String> {
    lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn required(lookup: Lookup<'_>, name: &'static str) -> Result<String, ConfigError> {
    optional(lookup, name).ok_or(ConfigError::Missing(name))
}

fn parsed<T>(lookup: Lookup<'_>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(lookup, name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}

fn positive(name: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

/// `DATABASE_URL`, `DATABASE_MAX_CONNECTIONS`.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            url: required(lookup, "DATABASE_URL")?,
            max_connections: positive(
                "DATABASE_MAX_CONNECTIONS",
                parsed(lookup, "DATABASE_MAX_CONNECTIONS", 10u64)?,
            )? as u32,
        })
    }

    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.url)
            .await
    }
}

/// Broker settings shared by the producer (API) and the consumer (worker).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// `None` builds a [`DisabledQueue`].
    pub redis_url: Option<String>,
    pub stream: String,
    pub dead_letter_stream: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub visibility_timeout: Duration,
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let visibility_secs = positive(
            "JOB_VISIBILITY_TIMEOUT_SECS",
            parsed(lookup, "JOB_VISIBILITY_TIMEOUT_SECS", 60u64)?,
        )?;
        Ok(Self {
            redis_url: optional(lookup, "REDIS_URL"),
            stream: optional(lookup, "JOB_STREAM").unwrap_or_else(|| "conreg:jobs".to_string()),
            dead_letter_stream: optional(lookup, "JOB_DEAD_LETTER_STREAM")
                .unwrap_or_else(|| "conreg:jobs:dlq".to_string()),
            consumer_group: optional(lookup, "JOB_CONSUMER_GROUP")
                .unwrap_or_else(|| "ticket-workers".to_string()),
            consumer_name: optional(lookup, "JOB_CONSUMER_NAME")
                .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::now_v7())),
            visibility_timeout: Duration::from_secs(visibility_secs),
        })
    }

    /// Build the configured queue: Redis Streams when `REDIS_URL` is set,
    /// otherwise a [`DisabledQueue`].
    pub async fn connect(&self) -> Result<Arc<dyn JobQueue>, QueueError> {
        let Some(url) = self.redis_url.as_deref() else {
            warn!("REDIS_URL not set; job queue disabled");
            return Ok(Arc::new(DisabledQueue));
        };
        self.connect_redis(url).await
    }

    #[cfg(feature = "redis")]
    async fn connect_redis(&self, url: &str) -> Result<Arc<dyn JobQueue>, QueueError> {
        let queue = crate::queue::RedisStreamsQueue::connect(url, self).await?;
        info!(stream = %self.stream, group = %self.consumer_group, consumer = %self.consumer_name, "job queue connected");
        Ok(Arc::new(queue))
    }

    #[cfg(not(feature = "redis"))]
    async fn connect_redis(&self, _url: &str) -> Result<Arc<dyn JobQueue>, QueueError> {
        info!(stream = %self.stream, "built without redis support");
        Err(QueueError::Connection(
            "REDIS_URL is set but this build has no redis support".to_string(),
        ))
    }
}

/// Consumer settings. Validated against the queue's visibility timeout.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: QueueConfig,
    pub job_timeout: Duration,
    pub receive_batch: usize,
    pub receive_wait: Duration,
    pub max_deliveries: u32,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let queue = QueueConfig::from_lookup(lookup)?;
        let job_timeout = Duration::from_secs(positive(
            "JOB_TIMEOUT_SECS",
            parsed(lookup, "JOB_TIMEOUT_SECS", 30u64)?,
        )?);
        let receive_batch = positive("JOB_RECEIVE_BATCH", parsed(lookup, "JOB_RECEIVE_BATCH", 1u64)?)? as usize;

        // The whole batch is leased at once, so every message in it has to
        // fit before the first lease runs out.
        let batch_budget = job_timeout.saturating_mul(u32::try_from(receive_batch).unwrap_or(u32::MAX));
        if batch_budget >= queue.visibility_timeout {
            return Err(ConfigError::VisibilityTooShort {
                receive_batch,
                job_timeout,
                visibility_timeout: queue.visibility_timeout,
            });
        }

        Ok(Self {
            queue,
            job_timeout,
            receive_batch,
            receive_wait: Duration::from_millis(parsed(lookup, "JOB_RECEIVE_WAIT_MS", 5000u64)?),
            max_deliveries: parsed(lookup, "JOB_MAX_DELIVERIES", 0u32)?,
        })
    }

    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            job_timeout: self.job_timeout,
            receive_batch: self.receive_batch,
            receive_wait: self.receive_wait,
            max_deliveries: self.max_deliveries,
            visibility_timeout: self.queue.visibility_timeout,
            backoff: Backoff::transport(),
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    /// Without a key the internal routes reject every request.
    pub internal_api_key: Option<String>,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 8080));
        Ok(Self {
            bind_addr: parsed(lookup, "BIND_ADDR", default_addr)?,
            internal_api_key: optional(lookup, "INTERNAL_API_KEY"),
        })
    }
}
