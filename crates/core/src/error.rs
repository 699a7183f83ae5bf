//! Identifier error model.

use thiserror::Error;

/// Failure to parse a string-encoded identifier.
///
/// Identifiers arrive as strings on the wire; anything that is not a UUID is an
/// input error and never reaches storage.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid {kind} {value:?}: {reason}")]
    Malformed {
        kind: &'static str,
        value: String,
        reason: String,
    },
}
