//! Queue consumer: receives jobs and applies them to the ticket inventory.

use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::info;

use conreg_infra::config::{DatabaseConfig, WorkerConfig};
use conreg_infra::jobs::JobDispatcher;
use conreg_infra::queue::QueueWorker;
use conreg_infra::repository::PostgresTicketRepository;
use conreg_infra::schema;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conreg_observability::init();

    let config = WorkerConfig::from_env()?;
    let database = DatabaseConfig::from_env()?;

    let queue = config.queue.connect().await.context("failed to connect to job queue")?;
    if !queue.is_enabled() {
        bail!("REDIS_URL is not set; the worker has no queue to consume");
    }

    let pool = database.connect().await.context("failed to connect to database")?;
    schema::verify(&pool).await?;

    let dispatcher = JobDispatcher::new(Arc::new(PostgresTicketRepository::new(pool)));
    let handle = QueueWorker::new(queue, dispatcher, config.settings()).spawn();

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown requested; finishing in-flight job");

    let stats = handle.shutdown().await;
    info!(
        received = stats.received,
        succeeded = stats.succeeded,
        unchanged = stats.unchanged,
        permanent_failures = stats.permanent_failures,
        transient_failures = stats.transient_failures,
        dead_lettered = stats.dead_lettered,
        "worker stopped"
    );
    Ok(())
}
