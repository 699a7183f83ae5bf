//! Applied-vs-unchanged results for idempotent mutations.

use serde::Serialize;

/// Result of a mutation that may already have been applied.
///
/// Jobs are delivered at least once, so every operation first checks whether
/// its post-condition already holds. `Unchanged` is a success, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", content = "value", rename_all = "snake_case")]
pub enum Change<T> {
    Applied(T),
    Unchanged(T),
}

impl<T> Change<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Change::Applied(_))
    }

    pub fn value(&self) -> &T {
        match self {
            Change::Applied(v) | Change::Unchanged(v) => v,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Change::Applied(v) | Change::Unchanged(v) => v,
        }
    }
}
