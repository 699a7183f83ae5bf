use chrono::{DateTime, Utc};
use conreg_core::{TicketId, TierId, UserId};
use serde::{Deserialize, Serialize};

use crate::change::Change;
use crate::error::TicketError;
use crate::status::TicketStatus;
use crate::tier::TicketTier;
use crate::user::User;

/// Badge fields printed on the convention badge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    pub con_badge_name: Option<String>,
    pub badge_image: Option<String>,
    pub is_fursuiter: bool,
    pub is_fursuit_staff: bool,
}

/// A ticket held by a user.
///
/// Created only by a successful purchase; hard-deleted only by cancelling a
/// ticket still awaiting review. Approved and denied tickets are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTicket {
    pub id: TicketId,
    pub user_id: UserId,
    pub tier_id: TierId,
    pub sequence_number: i32,
    pub reference_code: String,
    pub status: TicketStatus,
    #[serde(flatten)]
    pub badge: Badge,
    pub denial_reason: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<UserId>,
    pub denied_at: Option<DateTime<Utc>>,
    pub denied_by: Option<UserId>,
    pub previous_tier_id: Option<TierId>,
    pub previous_reference_code: Option<String>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Purchase eligibility, checked with the user row locked.
///
/// `existing` is the user's current non-denied ticket, if any. Returns
/// `Some(ticket)` when that ticket is already for `tier_id` (a redelivered
/// purchase), `None` when a new ticket should be issued.
pub fn check_purchaser(
    user: &User,
    existing: Option<UserTicket>,
    tier_id: TierId,
) -> Result<Option<UserTicket>, TicketError> {
    user.ensure_can_purchase()?;
    match existing {
        Some(ticket) if ticket.tier_id == tier_id => Ok(Some(ticket)),
        Some(ticket) => Err(TicketError::UserAlreadyHasTicket {
            user_id: user.id,
            ticket_id: ticket.id,
        }),
        None => Ok(None),
    }
}

impl UserTicket {
    /// Issue a new `pending` ticket. The caller has already taken one unit of
    /// stock from `tier` and computed `sequence` under the tier lock.
    pub fn issue(user_id: UserId, tier: &TicketTier, sequence: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: TicketId::new(),
            user_id,
            tier_id: tier.id,
            sequence_number: sequence,
            reference_code: tier.reference_code(sequence),
            status: TicketStatus::Pending,
            badge: Badge::default(),
            denial_reason: None,
            approved_at: None,
            approved_by: None,
            denied_at: None,
            denied_by: None,
            previous_tier_id: None,
            previous_reference_code: None,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn confirm_payment(mut self, now: DateTime<Utc>) -> Result<Change<Self>, TicketError> {
        match self.status {
            TicketStatus::SelfConfirmed | TicketStatus::Approved => Ok(Change::Unchanged(self)),
            TicketStatus::Pending => {
                self.status = TicketStatus::SelfConfirmed;
                self.updated_at = now;
                Ok(Change::Applied(self))
            }
            status => Err(TicketError::invalid_status("confirm payment for", status)),
        }
    }

    pub fn ensure_cancellable(&self) -> Result<(), TicketError> {
        if self.status.is_awaiting_review() {
            Ok(())
        } else {
            Err(TicketError::invalid_status("cancel", self.status))
        }
    }

    pub fn update_badge(mut self, badge: Badge, now: DateTime<Utc>) -> Result<Change<Self>, TicketError> {
        if self.status != TicketStatus::Approved {
            return Err(TicketError::invalid_status("update the badge of", self.status));
        }
        if self.badge == badge {
            return Ok(Change::Unchanged(self));
        }
        self.badge = badge;
        self.updated_at = now;
        Ok(Change::Applied(self))
    }

    pub fn approve(mut self, staff_id: UserId, now: DateTime<Utc>) -> Result<Change<Self>, TicketError> {
        match self.status {
            TicketStatus::Approved => Ok(Change::Unchanged(self)),
            status if status.is_awaiting_review() => {
                self.status = TicketStatus::Approved;
                self.approved_at = Some(now);
                self.approved_by = Some(staff_id);
                self.updated_at = now;
                Ok(Change::Applied(self))
            }
            status => Err(TicketError::invalid_status("approve", status)),
        }
    }

    /// Deny the ticket. On `Applied` the caller must return one unit of stock
    /// to the ticket's tier and record the denial against the owner, in the
    /// same transaction.
    pub fn deny(
        mut self,
        staff_id: UserId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Change<Self>, TicketError> {
        match self.status {
            TicketStatus::Denied => Ok(Change::Unchanged(self)),
            status if status.is_awaiting_review() => {
                self.status = TicketStatus::Denied;
                self.denied_at = Some(now);
                self.denied_by = Some(staff_id);
                self.denial_reason = Some(reason.to_string());
                self.updated_at = now;
                Ok(Change::Applied(self))
            }
            status => Err(TicketError::invalid_status("deny", status)),
        }
    }

    pub fn ensure_upgradable(&self) -> Result<(), TicketError> {
        if self.status == TicketStatus::Denied {
            return Err(TicketError::TicketDenied(self.id));
        }
        Ok(())
    }

    /// Move the ticket to a strictly more expensive tier.
    ///
    /// `current` and `target` are the locked tier rows. On `Applied` the caller
    /// has to persist both tiers: `current` gains a unit, `target` loses one.
    pub fn upgrade(
        mut self,
        current: &mut TicketTier,
        target: &mut TicketTier,
        sequence: i32,
        now: DateTime<Utc>,
    ) -> Result<Change<Self>, TicketError> {
        if self.tier_id == target.id {
            return Ok(Change::Unchanged(self));
        }
        self.ensure_upgradable()?;
        target.ensure_available()?;
        if target.price <= current.price {
            return Err(TicketError::CannotDowngrade {
                from: current.id,
                to: target.id,
            });
        }

        target.take_one()?;
        current.restock_one();

        self.previous_tier_id = Some(self.tier_id);
        self.previous_reference_code = Some(std::mem::take(&mut self.reference_code));
        self.tier_id = target.id;
        self.sequence_number = sequence;
        self.reference_code = target.reference_code(sequence);
        self.status = TicketStatus::Pending;
        self.approved_at = None;
        self.approved_by = None;
        self.denied_at = None;
        self.denied_by = None;
        self.denial_reason = None;
        self.updated_at = now;
        Ok(Change::Applied(self))
    }
}
