use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{info, warn};

use conreg_infra::jobs::JobError;

use crate::app::errors::{job_error_to_response, produce_error_to_response};
use crate::app::state::AppState;

/// `POST /internal/jobs`: run one job now, through the same dispatcher the
/// worker uses.
pub async fn run_job(State(state): State<AppState>, body: Bytes) -> Response {
    let result = tokio::time::timeout(state.job_timeout, state.dispatcher.handle_payload(&body))
        .await
        .unwrap_or_else(|_| Err(JobError::Timeout(state.job_timeout)));

    match result {
        Ok(outcome) => {
            if !outcome.changed {
                info!(action = outcome.action, "job was a no-op");
            }
            (
                StatusCode::OK,
                Json(json!({ "changed": outcome.changed, "result": outcome.result })),
            )
                .into_response()
        }
        Err(err) => {
            warn!(
                code = err.code(),
                disposition = %err.disposition(),
                error = %err,
                "internal job rejected"
            );
            job_error_to_response(&err)
        }
    }
}

/// `POST /jobs`: validate and hand off to the queue.
pub async fn enqueue_job(State(state): State<AppState>, body: Bytes) -> Response {
    match state.producer.enqueue_payload(&body).await {
        Ok((action, message_id)) => (
            StatusCode::ACCEPTED,
            Json(json!({ "action": action.name(), "message_id": message_id })),
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "job not enqueued");
            produce_error_to_response(&err)
        }
    }
}
