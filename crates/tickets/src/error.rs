//! Business-rule error taxonomy.
//!
//! Every variant here is deterministic: redelivering the same job against the
//! same rows yields the same rejection.

use conreg_core::{TicketId, TierId, UserId};
use thiserror::Error;

use crate::status::TicketStatus;

/// How a ticket was looked up when it could not be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketLookup {
    ByUser(UserId),
    ById(TicketId),
}

impl core::fmt::Display for TicketLookup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TicketLookup::ByUser(id) => write!(f, "user {id}"),
            TicketLookup::ById(id) => write!(f, "ticket {id}"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TicketError {
    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("user {0} is blacklisted")]
    UserBlacklisted(UserId),

    #[error("user {user_id} already holds ticket {ticket_id} for another tier")]
    UserAlreadyHasTicket { user_id: UserId, ticket_id: TicketId },

    #[error("ticket tier {0} not found or not on sale")]
    TicketTierNotFound(TierId),

    #[error("ticket tier {0} is out of stock")]
    OutOfStock(TierId),

    #[error("no ticket found for {0}")]
    TicketNotFound(TicketLookup),

    #[error("cannot {operation} a ticket in status {status}")]
    InvalidTicketStatus {
        operation: &'static str,
        status: TicketStatus,
    },

    #[error("ticket {0} was denied and cannot be upgraded")]
    TicketDenied(TicketId),

    #[error("cannot move from tier {from} to tier {to}: target price must be higher")]
    CannotDowngrade { from: TierId, to: TierId },
}

impl TicketError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            TicketError::UserNotFound(_) => "user_not_found",
            TicketError::UserBlacklisted(_) => "user_blacklisted",
            TicketError::UserAlreadyHasTicket { .. } => "user_already_has_ticket",
            TicketError::TicketTierNotFound(_) => "ticket_tier_not_found",
            TicketError::OutOfStock(_) => "out_of_stock",
            TicketError::TicketNotFound(_) => "ticket_not_found",
            TicketError::InvalidTicketStatus { .. } => "invalid_ticket_status",
            TicketError::TicketDenied(_) => "ticket_denied",
            TicketError::CannotDowngrade { .. } => "cannot_downgrade",
        }
    }

    pub(crate) fn invalid_status(operation: &'static str, status: TicketStatus) -> Self {
        TicketError::InvalidTicketStatus { operation, status }
    }
}
