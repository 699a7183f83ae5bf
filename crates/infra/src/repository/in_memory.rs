use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use conreg_core::{TicketId, TierId, UserId};
use conreg_tickets::{
    Badge, Change, TicketError, TicketLookup, TicketStatus, TicketTier, User, UserTicket,
    check_purchaser,
};

use super::{RepositoryResult, TicketRepository};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    tiers: HashMap<TierId, TicketTier>,
    tickets: HashMap<TicketId, UserTicket>,
}

impl Tables {
    fn live_user(&self, user_id: UserId) -> Result<&User, TicketError> {
        self.users
            .get(&user_id)
            .filter(|u| !u.is_deleted)
            .ok_or(TicketError::UserNotFound(user_id))
    }

    /// The user's non-deleted ticket, preferring a non-denied one, newest first.
    fn active_ticket(&self, user_id: UserId) -> Option<UserTicket> {
        self.tickets
            .values()
            .filter(|t| t.user_id == user_id && !t.is_deleted)
            .max_by_key(|t| (t.status != TicketStatus::Denied, t.created_at, t.id))
            .cloned()
    }

    fn require_active_ticket(&self, user_id: UserId) -> Result<UserTicket, TicketError> {
        self.active_ticket(user_id)
            .ok_or(TicketError::TicketNotFound(TicketLookup::ByUser(user_id)))
    }

    fn ticket_by_id(&self, ticket_id: TicketId) -> Result<UserTicket, TicketError> {
        self.tickets
            .get(&ticket_id)
            .filter(|t| !t.is_deleted)
            .cloned()
            .ok_or(TicketError::TicketNotFound(TicketLookup::ById(ticket_id)))
    }

    fn tier(&self, tier_id: TierId) -> Result<TicketTier, TicketError> {
        self.tiers
            .get(&tier_id)
            .cloned()
            .ok_or(TicketError::TicketTierNotFound(tier_id))
    }

    fn next_sequence(&self, tier_id: TierId) -> i32 {
        self.tickets
            .values()
            .filter(|t| t.tier_id == tier_id)
            .map(|t| t.sequence_number)
            .max()
            .unwrap_or(0)
            + 1
    }

    fn save_ticket(&mut self, ticket: &UserTicket) {
        self.tickets.insert(ticket.id, ticket.clone());
    }

    fn save_tier(&mut self, tier: TicketTier) {
        self.tiers.insert(tier.id, tier);
    }
}

/// In-memory ticket repository.
///
/// Intended for tests/dev. A single async mutex stands in for row locks: every
/// operation holds it for its whole duration, works on copies of the rows and
/// writes them back only once every check has passed.
#[derive(Debug, Default)]
pub struct InMemoryTicketRepository {
    tables: Mutex<Tables>,
}

impl InMemoryTicketRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.tables.lock().await.users.insert(user.id, user);
    }

    pub async fn insert_tier(&self, tier: TicketTier) {
        self.tables.lock().await.save_tier(tier);
    }

    pub async fn user(&self, user_id: UserId) -> Option<User> {
        self.tables.lock().await.users.get(&user_id).cloned()
    }

    pub async fn tier(&self, tier_id: TierId) -> Option<TicketTier> {
        self.tables.lock().await.tiers.get(&tier_id).cloned()
    }

    pub async fn ticket(&self, ticket_id: TicketId) -> Option<UserTicket> {
        self.tables.lock().await.tickets.get(&ticket_id).cloned()
    }

    pub async fn tickets_for(&self, user_id: UserId) -> Vec<UserTicket> {
        let tables = self.tables.lock().await;
        let mut tickets: Vec<_> = tables
            .tickets
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tickets.sort_by_key(|t| (t.created_at, t.id));
        tickets
    }
}

#[async_trait]
impl TicketRepository for InMemoryTicketRepository {
    async fn purchase(&self, user_id: UserId, tier_id: TierId) -> RepositoryResult<Change<UserTicket>> {
        let mut db = self.tables.lock().await;

        let user = db.live_user(user_id)?;
        let existing = db
            .active_ticket(user_id)
            .filter(|t| t.status != TicketStatus::Denied);
        if let Some(ticket) = check_purchaser(user, existing, tier_id)? {
            return Ok(Change::Unchanged(ticket));
        }

        let mut tier = db.tier(tier_id)?;
        tier.take_one()?;
        let sequence = db.next_sequence(tier_id);
        let ticket = UserTicket::issue(user_id, &tier, sequence, Utc::now());

        db.save_tier(tier);
        db.save_ticket(&ticket);
        Ok(Change::Applied(ticket))
    }

    async fn confirm_payment(&self, user_id: UserId) -> RepositoryResult<Change<UserTicket>> {
        let mut db = self.tables.lock().await;
        let change = db.require_active_ticket(user_id)?.confirm_payment(Utc::now())?;
        if change.is_applied() {
            db.save_ticket(change.value());
        }
        Ok(change)
    }

    async fn cancel(&self, user_id: UserId) -> RepositoryResult<Change<Option<UserTicket>>> {
        let mut db = self.tables.lock().await;
        let Some(ticket) = db.active_ticket(user_id) else {
            return Ok(Change::Unchanged(None));
        };
        ticket.ensure_cancellable()?;

        let mut tier = db.tier(ticket.tier_id)?;
        tier.restock_one();
        db.save_tier(tier);
        db.tickets.remove(&ticket.id);
        Ok(Change::Applied(Some(ticket)))
    }

    async fn update_badge(&self, user_id: UserId, badge: Badge) -> RepositoryResult<Change<UserTicket>> {
        let mut db = self.tables.lock().await;
        let change = db.require_active_ticket(user_id)?.update_badge(badge, Utc::now())?;
        if change.is_applied() {
            db.save_ticket(change.value());
        }
        Ok(change)
    }

    async fn approve(&self, ticket_id: TicketId, staff_id: UserId) -> RepositoryResult<Change<UserTicket>> {
        let mut db = self.tables.lock().await;
        let change = db.ticket_by_id(ticket_id)?.approve(staff_id, Utc::now())?;
        if change.is_applied() {
            db.save_ticket(change.value());
        }
        Ok(change)
    }

    async fn deny(
        &self,
        ticket_id: TicketId,
        staff_id: UserId,
        reason: &str,
    ) -> RepositoryResult<Change<UserTicket>> {
        let mut db = self.tables.lock().await;
        let now = Utc::now();
        let change = db.ticket_by_id(ticket_id)?.deny(staff_id, reason, now)?;
        if !change.is_applied() {
            return Ok(change);
        }

        let ticket = change.value();
        let mut owner = db.live_user(ticket.user_id)?.clone();
        let mut tier = db.tier(ticket.tier_id)?;
        owner.record_denial(now);
        tier.restock_one();

        db.users.insert(owner.id, owner);
        db.save_tier(tier);
        db.save_ticket(ticket);
        Ok(change)
    }

    async fn upgrade(&self, user_id: UserId, tier_id: TierId) -> RepositoryResult<Change<UserTicket>> {
        let mut db = self.tables.lock().await;
        let ticket = db.require_active_ticket(user_id)?;
        if ticket.tier_id == tier_id {
            return Ok(Change::Unchanged(ticket));
        }
        ticket.ensure_upgradable()?;

        let mut current = db.tier(ticket.tier_id)?;
        let mut target = db.tier(tier_id)?;
        let sequence = db.next_sequence(tier_id);
        let change = ticket.upgrade(&mut current, &mut target, sequence, Utc::now())?;
        if change.is_applied() {
            db.save_tier(current);
            db.save_tier(target);
            db.save_ticket(change.value());
        }
        Ok(change)
    }

    async fn blacklist(&self, user_id: UserId, reason: Option<&str>) -> RepositoryResult<()> {
        let mut db = self.tables.lock().await;
        let mut user = db.live_user(user_id)?.clone();
        user.blacklist(reason.map(str::to_string), Utc::now());
        db.users.insert(user_id, user);
        Ok(())
    }

    async fn unblacklist(&self, user_id: UserId) -> RepositoryResult<()> {
        let mut db = self.tables.lock().await;
        let mut user = db.live_user(user_id)?.clone();
        user.unblacklist();
        db.users.insert(user_id, user);
        Ok(())
    }
}
