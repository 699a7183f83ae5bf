//! Queue worker: the receive / process / acknowledge loop.
//!
//! Per message:
//! - success (applied or idempotent no-op) -> delete
//! - permanent failure -> delete (the job can never succeed)
//! - transient failure -> leave it; the broker redelivers after the visibility timeout
//!
//! Each message runs under `job_timeout`. A timed-out repository future is
//! dropped, which rolls its transaction back.
//!
//! A received batch is leased as a whole, so the worker only starts a message
//! while it can still finish before the lease runs out. The rest of the batch
//! is left for redelivery rather than processed after another consumer may
//! already hold it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::{JobQueue, QueueError, QueueMessage};
use crate::jobs::{Backoff, Disposition, JobAction, JobDispatcher, JobError};
use crate::repository::TicketRepository;

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Per-message processing deadline
    pub job_timeout: Duration,
    /// Messages per receive call
    pub receive_batch: usize,
    /// How long a receive blocks when the queue is empty
    pub receive_wait: Duration,
    /// Deliveries before a message is dead-lettered (0 = unlimited)
    pub max_deliveries: u32,
    /// How long the broker hides a received message
    pub visibility_timeout: Duration,
    /// Back-off between failed receive calls
    pub backoff: Backoff,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(30),
            receive_batch: 1,
            receive_wait: Duration::from_secs(5),
            max_deliveries: 0,
            visibility_timeout: Duration::from_secs(60),
            backoff: Backoff::transport(),
        }
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub succeeded: u64,
    pub unchanged: u64,
    pub permanent_failures: u64,
    pub transient_failures: u64,
    pub dead_lettered: u64,
    pub receive_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    succeeded: AtomicU64,
    unchanged: AtomicU64,
    permanent_failures: AtomicU64,
    transient_failures: AtomicU64,
    dead_lettered: AtomicU64,
    receive_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Applied,
    Unchanged,
    Dropped,
    LeftForRedelivery,
    DeadLettered,
}

pub struct QueueWorker<Q, R> {
    queue: Q,
    dispatcher: JobDispatcher<R>,
    settings: WorkerSettings,
    counters: Arc<Counters>,
}

impl<Q, R> QueueWorker<Q, R>
where
    Q: JobQueue + 'static,
    R: TicketRepository + 'static,
{
    pub fn new(queue: Q, dispatcher: JobDispatcher<R>, settings: WorkerSettings) -> Self {
        Self {
            queue,
            dispatcher,
            settings,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Handle one received message to completion, deleting it unless the
    /// failure is transient.
    pub async fn process(&self, message: &QueueMessage) -> Processed {
        let span = info_span!(
            "job",
            message_id = %message.id,
            delivery_count = message.delivery_count,
            action = tracing::field::Empty,
        );
        self.process_inner(message).instrument(span).await
    }

    async fn process_inner(&self, message: &QueueMessage) -> Processed {
        Counters::bump(&self.counters.received);
        let cap = self.settings.max_deliveries;

        // Already past the cap without a recorded failure (e.g. the worker
        // died mid-job every time).
        if cap > 0 && message.delivery_count > cap {
            let reason = format!("exceeded {cap} deliveries");
            return self.dead_letter(message, &reason).await;
        }

        let result = match JobAction::decode(&message.body) {
            Ok(action) => {
                tracing::Span::current().record("action", action.name());
                let timeout = self.settings.job_timeout;
                match tokio::time::timeout(timeout, self.dispatcher.dispatch(action)).await {
                    Ok(result) => result,
                    Err(_) => Err(JobError::Timeout(timeout)),
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) if outcome.changed => {
                debug!("job applied");
                Counters::bump(&self.counters.succeeded);
                self.delete(message).await;
                Processed::Applied
            }
            Ok(_) => {
                info!("job already applied; nothing to do");
                Counters::bump(&self.counters.unchanged);
                self.delete(message).await;
                Processed::Unchanged
            }
            Err(err) => match err.disposition() {
                Disposition::Permanent => {
                    warn!(
                        error = %err,
                        code = err.code(),
                        disposition = %Disposition::Permanent,
                        "job failed permanently; dropping message"
                    );
                    Counters::bump(&self.counters.permanent_failures);
                    self.delete(message).await;
                    Processed::Dropped
                }
                Disposition::Transient if cap > 0 && message.delivery_count >= cap => {
                    Counters::bump(&self.counters.transient_failures);
                    self.dead_letter(message, &err.to_string()).await
                }
                Disposition::Transient => {
                    warn!(
                        error = %err,
                        code = err.code(),
                        disposition = %Disposition::Transient,
                        "job failed transiently; leaving message for redelivery"
                    );
                    Counters::bump(&self.counters.transient_failures);
                    Processed::LeftForRedelivery
                }
            },
        }
    }

    async fn delete(&self, message: &QueueMessage) {
        // Undeleted messages come back after the visibility timeout and
        // the job is idempotent, so a failed delete is only logged.
        if let Err(e) = self.queue.delete(message).await {
            error!(error = %e, "failed to delete message");
        }
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Processed {
        if let Err(e) = self.queue.dead_letter(message, reason).await {
            error!(error = %e, "failed to dead-letter message; leaving it for redelivery");
            return Processed::LeftForRedelivery;
        }
        Counters::bump(&self.counters.dead_lettered);
        self.delete(message).await;
        Processed::DeadLettered
    }

    /// Receive one batch and process it. Returns the number of messages
    /// handled; the rest of the batch, if any, is left for redelivery.
    pub async fn run_once(&self) -> Result<usize, QueueError> {
        let batch = self
            .queue
            .receive(self.settings.receive_batch, self.settings.receive_wait)
            .await?;
        let leased_at = Instant::now();
        Ok(self.process_batch(&batch, leased_at, None).await)
    }

    /// Whether a message leased at `leased_at` can still run to its deadline
    /// before the broker hands it to someone else.
    fn lease_has_room(&self, leased_at: Instant) -> bool {
        leased_at.elapsed() + self.settings.job_timeout < self.settings.visibility_timeout
    }

    async fn process_batch(
        &self,
        batch: &[QueueMessage],
        leased_at: Instant,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> usize {
        for (handled, message) in batch.iter().enumerate() {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                return handled;
            }
            if !self.lease_has_room(leased_at) {
                warn!(
                    left = batch.len() - handled,
                    elapsed_ms = leased_at.elapsed().as_millis() as u64,
                    "batch lease nearly spent; leaving the rest for redelivery"
                );
                return handled;
            }
            self.process(message).await;
        }
        batch.len()
    }

    /// Poll until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Shutdown is checked between messages; a message in flight is finished
    /// first. Unprocessed messages of the current batch stay with the broker.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        info!(
            job_timeout_ms = self.settings.job_timeout.as_millis() as u64,
            receive_batch = self.settings.receive_batch,
            max_deliveries = self.settings.max_deliveries,
            "queue worker started"
        );
        let mut failed_receives = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                r = self.queue.receive(self.settings.receive_batch, self.settings.receive_wait) => r,
            };

            match received {
                Ok(batch) => {
                    failed_receives = 0;
                    let leased_at = Instant::now();
                    self.process_batch(&batch, leased_at, Some(&shutdown)).await;
                }
                Err(e) => {
                    failed_receives = failed_receives.saturating_add(1);
                    Counters::bump(&self.counters.receive_errors);
                    let delay = self.settings.backoff.delay(failed_receives);
                    error!(
                        error = %e,
                        attempt = failed_receives,
                        retry_in_ms = delay.as_millis() as u64,
                        "failed to receive jobs"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        let stats = self.stats();
        info!(?stats, "queue worker stopped");
        stats
    }

    /// Run on a background task.
    pub fn spawn(self) -> WorkerHandle
    where
        Q: Send + Sync,
        R: Send + Sync,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = self.counters.clone();
        let join = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle {
            shutdown: shutdown_tx,
            join,
            counters,
        }
    }
}

/// Handle to control a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<WorkerStats>,
    counters: Arc<Counters>,
}

impl WorkerHandle {
    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Request graceful shutdown and wait for the loop to exit.
    pub async fn shutdown(self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        match self.join.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "queue worker task failed");
                self.counters.snapshot()
            }
        }
    }
}
