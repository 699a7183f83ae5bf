//! Infrastructure layer: repositories, job decoding and dispatch, the job
//! queue and its consumer loop, configuration.

pub mod config;
pub mod jobs;
pub mod queue;
pub mod repository;
pub mod schema;

#[cfg(test)]
mod integration_tests;
