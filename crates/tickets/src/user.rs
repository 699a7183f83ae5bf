use chrono::{DateTime, Utc};
use conreg_core::UserId;
use serde::{Deserialize, Serialize};

use crate::error::TicketError;

/// Denials after which a user is blacklisted automatically.
pub const AUTO_BLACKLIST_THRESHOLD: i32 = 3;

pub const AUTO_BLACKLIST_REASON: &str = "Automatically blacklisted after 3 denied tickets";

/// The slice of a user row the ticket workflow reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub is_blacklisted: bool,
    pub blacklisted_at: Option<DateTime<Utc>>,
    pub blacklist_reason: Option<String>,
    pub denial_count: i32,
    pub is_deleted: bool,
}

impl User {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            is_blacklisted: false,
            blacklisted_at: None,
            blacklist_reason: None,
            denial_count: 0,
            is_deleted: false,
        }
    }

    pub fn ensure_exists(&self) -> Result<(), TicketError> {
        if self.is_deleted {
            return Err(TicketError::UserNotFound(self.id));
        }
        Ok(())
    }

    pub fn ensure_can_purchase(&self) -> Result<(), TicketError> {
        self.ensure_exists()?;
        if self.is_blacklisted {
            return Err(TicketError::UserBlacklisted(self.id));
        }
        Ok(())
    }

    /// Count one more denied ticket. Returns `true` if this denial tipped the
    /// user over the threshold and blacklisted them.
    pub fn record_denial(&mut self, now: DateTime<Utc>) -> bool {
        self.denial_count += 1;
        if self.denial_count >= AUTO_BLACKLIST_THRESHOLD && !self.is_blacklisted {
            self.is_blacklisted = true;
            self.blacklisted_at = Some(now);
            self.blacklist_reason = Some(AUTO_BLACKLIST_REASON.to_string());
            return true;
        }
        false
    }

    /// Admin blacklist. Re-blacklisting keeps the original timestamp.
    pub fn blacklist(&mut self, reason: Option<String>, now: DateTime<Utc>) {
        if !self.is_blacklisted {
            self.blacklisted_at = Some(now);
        }
        self.is_blacklisted = true;
        self.blacklist_reason = reason;
    }

    /// Admin unblacklist; also forgives past denials.
    pub fn unblacklist(&mut self) {
        self.is_blacklisted = false;
        self.blacklisted_at = None;
        self.blacklist_reason = None;
        self.denial_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn third_denial_blacklists() {
        let mut user = User::new(UserId::new());
        let now = Utc::now();

        assert!(!user.record_denial(now));
        assert!(!user.record_denial(now));
        assert!(!user.is_blacklisted);
        assert_eq!(user.denial_count, 2);

        assert!(user.record_denial(now));
        assert!(user.is_blacklisted);
        assert_eq!(user.blacklisted_at, Some(now));
        assert_eq!(user.blacklist_reason.as_deref(), Some(AUTO_BLACKLIST_REASON));
    }

    #[test]
    fn manual_blacklist_reason_survives_later_denials() {
        let mut user = User::new(UserId::new());
        user.blacklist(Some("chargeback".to_string()), Utc::now());
        for _ in 0..3 {
            assert!(!user.record_denial(Utc::now()));
        }
        assert_eq!(user.blacklist_reason.as_deref(), Some("chargeback"));
    }

    #[test]
    fn unblacklist_resets_denials() {
        let mut user = User::new(UserId::new());
        for _ in 0..3 {
            user.record_denial(Utc::now());
        }
        user.unblacklist();
        assert!(!user.is_blacklisted);
        assert_eq!(user.denial_count, 0);
        assert!(user.ensure_can_purchase().is_ok());
    }

    #[test]
    fn deleted_user_is_not_found() {
        let mut user = User::new(UserId::new());
        user.is_deleted = true;
        assert_eq!(user.ensure_can_purchase(), Err(TicketError::UserNotFound(user.id)));
    }
}
