//! Ticket inventory domain (convention registration).
//!
//! Tiers, tickets and the blacklist subset of users, plus every state-machine
//! decision the job consumer makes. Pure logic only: no IO, no SQL, no queue.
//! Storage backends lock the rows they need and then call into this crate, so
//! the rules are identical no matter which backend runs them.

pub mod change;
pub mod error;
pub mod status;
pub mod ticket;
pub mod tier;
pub mod user;

pub use change::Change;
pub use error::{TicketError, TicketLookup};
pub use status::{TicketStatus, UnknownStatus};
pub use ticket::{Badge, UserTicket, check_purchaser};
pub use tier::{TicketTier, reference_code};
pub use user::{AUTO_BLACKLIST_REASON, AUTO_BLACKLIST_THRESHOLD, User};
