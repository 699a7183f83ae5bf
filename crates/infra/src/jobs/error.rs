use std::time::Duration;

use thiserror::Error;

use conreg_core::IdError;
use conreg_tickets::TicketError;

use crate::repository::RepositoryError;

/// Everything that can go wrong handling one job.
///
/// Input errors are produced by the decoder before any storage is touched.
/// `Rule` and `Database` come from the repository unchanged. See
/// [`JobError::disposition`] for how each variant is treated by the queue.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("malformed job message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown action {0:?}")]
    UnknownAction(String),

    #[error("{action} job is missing required field {field}")]
    MissingField {
        action: &'static str,
        field: &'static str,
    },

    #[error("invalid identifier in field {field}: {source}")]
    InvalidIdentifier {
        field: &'static str,
        #[source]
        source: IdError,
    },

    #[error(transparent)]
    Rule(#[from] TicketError),

    #[error("database error in {operation}: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("job did not finish within {0:?}")]
    Timeout(Duration),
}

impl From<RepositoryError> for JobError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Rule(e) => JobError::Rule(e),
            RepositoryError::Database { operation, source } => JobError::Database { operation, source },
        }
    }
}

impl JobError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::Malformed(_) => "malformed_message",
            JobError::UnknownAction(_) => "unknown_action",
            JobError::MissingField { .. } => "missing_field",
            JobError::InvalidIdentifier { .. } => "invalid_identifier",
            JobError::Rule(e) => e.code(),
            JobError::Database { .. } => "database_error",
            JobError::Timeout(_) => "timeout",
        }
    }

    /// Rejected by the decoder, before the repository was called.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            JobError::Malformed(_)
                | JobError::UnknownAction(_)
                | JobError::MissingField { .. }
                | JobError::InvalidIdentifier { .. }
        )
    }
}
