use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use conreg_api::app::{AppState, build_app};
use conreg_infra::config::{ApiConfig, DatabaseConfig, WorkerConfig};
use conreg_infra::queue::{DisabledQueue, JobQueue};
use conreg_infra::repository::PostgresTicketRepository;
use conreg_infra::schema;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conreg_observability::init();

    let api = ApiConfig::from_env()?;
    let database = DatabaseConfig::from_env()?;
    let jobs = WorkerConfig::from_env()?;

    let pool = database.connect().await.context("failed to connect to database")?;
    schema::verify(&pool).await?;

    let queue: Arc<dyn JobQueue> = match jobs.queue.connect().await {
        Ok(queue) => queue,
        Err(e) => {
            error!(error = %e, "job queue unreachable; enqueue requests will be refused");
            Arc::new(DisabledQueue)
        }
    };

    if api.internal_api_key.is_none() {
        warn!("INTERNAL_API_KEY not set; internal routes will reject every request");
    }

    let repository = Arc::new(PostgresTicketRepository::new(pool));
    let state = AppState::new(repository, queue, jobs.job_timeout)
        .with_internal_api_key(api.internal_api_key);

    let listener = tokio::net::TcpListener::bind(api.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", api.bind_addr))?;

    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}
