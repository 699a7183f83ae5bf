//! HTTP API application wiring (Axum router + shared state).
//!
//! - `state.rs`: what handlers share (dispatcher, producer, API key)
//! - `routes/`: HTTP handlers
//! - `errors.rs`: consistent error responses

use axum::{
    Router,
    routing::{get, post},
};

use crate::middleware;

pub mod errors;
pub mod routes;
pub mod state;

pub use state::AppState;

/// Build the full HTTP router (public entrypoint used by `main.rs` and tests).
pub fn build_app(state: AppState) -> Router {
    // Internal routes: require the shared API key.
    let internal = Router::new()
        .route("/internal/jobs", post(routes::jobs::run_job))
        .route("/jobs", post(routes::jobs::enqueue_job))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_internal_key,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(internal)
        .with_state(state)
}
