//! Inventory repository boundary.
//!
//! Every operation runs as exactly one transaction: lock the rows it touches,
//! check whether the requested end state already holds (returning
//! `Change::Unchanged` if so), then apply the domain decision from
//! `conreg_tickets` and write back. Redelivering a job therefore never applies
//! it twice.
//!
//! Two backends implement the trait:
//! - [`PostgresTicketRepository`]: `SELECT ... FOR UPDATE` inside a sqlx transaction
//! - [`InMemoryTicketRepository`]: one mutex over all tables (tests/dev)

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use conreg_core::{TicketId, TierId, UserId};
use conreg_tickets::{Badge, Change, TicketError, UserTicket};

pub use in_memory::InMemoryTicketRepository;
pub use postgres::PostgresTicketRepository;

/// Repository operation error.
///
/// `Rule` is a deterministic business-rule rejection. `Database` is anything
/// the storage layer reported (connectivity, deadlock, serialization failure).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Rule(#[from] TicketError),

    #[error("database error in {operation}: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

impl RepositoryError {
    pub(crate) fn database(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| RepositoryError::Database { operation, source }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Transactional ticket inventory operations.
#[async_trait]
pub trait TicketRepository: Send + Sync {
    /// Issue a ticket for `tier_id` to `user_id`, taking one unit of stock.
    async fn purchase(&self, user_id: UserId, tier_id: TierId) -> RepositoryResult<Change<UserTicket>>;

    /// `pending` -> `self_confirmed` on the user's active ticket.
    async fn confirm_payment(&self, user_id: UserId) -> RepositoryResult<Change<UserTicket>>;

    /// Delete the user's active ticket and restock its tier.
    ///
    /// `Unchanged(None)` when there was nothing to cancel.
    async fn cancel(&self, user_id: UserId) -> RepositoryResult<Change<Option<UserTicket>>>;

    async fn update_badge(&self, user_id: UserId, badge: Badge) -> RepositoryResult<Change<UserTicket>>;

    async fn approve(&self, ticket_id: TicketId, staff_id: UserId) -> RepositoryResult<Change<UserTicket>>;

    /// Deny a ticket, restock its tier and count the denial against its owner.
    async fn deny(
        &self,
        ticket_id: TicketId,
        staff_id: UserId,
        reason: &str,
    ) -> RepositoryResult<Change<UserTicket>>;

    /// Move the user's active ticket to a strictly more expensive tier.
    async fn upgrade(&self, user_id: UserId, tier_id: TierId) -> RepositoryResult<Change<UserTicket>>;

    /// Set the blacklist flag. Succeeds whether or not the flag was already set.
    async fn blacklist(&self, user_id: UserId, reason: Option<&str>) -> RepositoryResult<()>;

    /// Clear the blacklist flag and forgive past denials.
    async fn unblacklist(&self, user_id: UserId) -> RepositoryResult<()>;
}

#[async_trait]
impl<R> TicketRepository for Arc<R>
where
    R: TicketRepository + ?Sized,
{
    async fn purchase(&self, user_id: UserId, tier_id: TierId) -> RepositoryResult<Change<UserTicket>> {
        (**self).purchase(user_id, tier_id).await
    }

    async fn confirm_payment(&self, user_id: UserId) -> RepositoryResult<Change<UserTicket>> {
        (**self).confirm_payment(user_id).await
    }

    async fn cancel(&self, user_id: UserId) -> RepositoryResult<Change<Option<UserTicket>>> {
        (**self).cancel(user_id).await
    }

    async fn update_badge(&self, user_id: UserId, badge: Badge) -> RepositoryResult<Change<UserTicket>> {
        (**self).update_badge(user_id, badge).await
    }

    async fn approve(&self, ticket_id: TicketId, staff_id: UserId) -> RepositoryResult<Change<UserTicket>> {
        (**self).approve(ticket_id, staff_id).await
    }

    async fn deny(
        &self,
        ticket_id: TicketId,
        staff_id: UserId,
        reason: &str,
    ) -> RepositoryResult<Change<UserTicket>> {
        (**self).deny(ticket_id, staff_id, reason).await
    }

    async fn upgrade(&self, user_id: UserId, tier_id: TierId) -> RepositoryResult<Change<UserTicket>> {
        (**self).upgrade(user_id, tier_id).await
    }

    async fn blacklist(&self, user_id: UserId, reason: Option<&str>) -> RepositoryResult<()> {
        (**self).blacklist(user_id, reason).await
    }

    async fn unblacklist(&self, user_id: UserId) -> RepositoryResult<()> {
        (**self).unblacklist(user_id).await
    }
}
