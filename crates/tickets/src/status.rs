use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ticket workflow status.
///
/// `pending -> self_confirmed -> approved`, or `pending | self_confirmed -> denied`.
/// An upgrade moves any non-denied ticket back to `pending` under the new tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    SelfConfirmed,
    Approved,
    Denied,
}

impl TicketStatus {
    pub const ALL: [TicketStatus; 4] = [
        TicketStatus::Pending,
        TicketStatus::SelfConfirmed,
        TicketStatus::Approved,
        TicketStatus::Denied,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Pending => "pending",
            TicketStatus::SelfConfirmed => "self_confirmed",
            TicketStatus::Approved => "approved",
            TicketStatus::Denied => "denied",
        }
    }

    /// Staff have not decided yet; the ticket may still be cancelled, approved or denied.
    pub fn is_awaiting_review(self) -> bool {
        matches!(self, TicketStatus::Pending | TicketStatus::SelfConfirmed)
    }
}

impl core::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown ticket status {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for TicketStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TicketStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_form_round_trips_for_every_status() {
        for status in TicketStatus::ALL {
            assert_eq!(status.as_str().parse::<TicketStatus>(), Ok(status));
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert_eq!(
            "refunded".parse::<TicketStatus>(),
            Err(UnknownStatus("refunded".to_string()))
        );
    }
}
