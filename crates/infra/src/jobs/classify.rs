//! Permanent vs transient failure classification.

use std::fmt;

use serde::Serialize;

use super::error::JobError;

/// What the queue should do with a message whose handling failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Redelivery cannot change the outcome. Delete the message.
    Permanent,
    /// Infrastructure fault. Leave the message for redelivery.
    Transient,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Permanent => "permanent",
            Disposition::Transient => "transient",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobError {
    /// The only place that decides whether a failed job is retried.
    ///
    /// Input errors and business-rule rejections are deterministic for an
    /// unchanged message, and so are database errors about the data itself:
    /// rows that fail to decode and integrity constraint violations. Lost
    /// connections, deadlocks, serialization failures, pool exhaustion and
    /// timeouts are not.
    pub fn disposition(&self) -> Disposition {
        match self {
            JobError::Malformed(_)
            | JobError::UnknownAction(_)
            | JobError::MissingField { .. }
            | JobError::InvalidIdentifier { .. }
            | JobError::Rule(_) => Disposition::Permanent,
            JobError::Database { source, .. } if is_data_error(source) => Disposition::Permanent,
            JobError::Database { .. } | JobError::Timeout(_) => Disposition::Transient,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.disposition() == Disposition::Permanent
    }
}

/// Errors that the same statement against the same rows would hit again.
fn is_data_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::Encode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::TypeNotFound { .. } => true,
        // SQLSTATE class 23: integrity constraint violation.
        sqlx::Error::Database(db) => db.code().is_some_and(|code| code.starts_with("23")),
        _ => false,
    }
}
