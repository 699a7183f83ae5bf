//! Ticket jobs: wire format, dispatch, failure classification and back-off.
//!
//! ## Components
//!
//! - `JobMessage` / `JobAction`: the queue body and its typed form (decode + encode)
//! - `JobDispatcher`: routes one decoded action to one repository operation
//! - `JobError` + `Disposition`: the single place that decides permanent vs transient
//! - `Backoff`: pacing for queue transport failures
//! - `JobProducer`: validates and enqueues outgoing jobs

pub mod classify;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod producer;
pub mod retry;

pub use classify::Disposition;
pub use dispatcher::{JobDispatcher, JobOutcome};
pub use error::JobError;
pub use message::{JobAction, JobMessage};
pub use producer::{JobProducer, ProduceError};
pub use retry::Backoff;
