//! `conreg-core`: strongly-typed identifiers.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::IdError;
pub use id::{TicketId, TierId, UserId};
