//! Job dispatch pipeline.
//!
//! ```text
//! payload bytes
//!   ↓
//! 1. Decode into a JobAction (input errors stop here, storage untouched)
//!   ↓
//! 2. Call exactly one repository operation
//!   ↓
//! 3. Report applied / unchanged, or forward the repository error as-is
//! ```
//!
//! The queue worker and the synchronous internal HTTP route both go through
//! this type, so a job behaves the same whichever way it arrives. The
//! dispatcher does not interpret errors; callers ask
//! [`JobError::disposition`](super::JobError::disposition).

use serde::Serialize;
use tracing::instrument;

use conreg_tickets::{Change, UserTicket};

use super::error::JobError;
use super::message::JobAction;
use crate::repository::TicketRepository;

/// Successful handling of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub action: &'static str,
    /// `false` when the requested end state already held (idempotent no-op).
    pub changed: bool,
    /// The ticket as it stands after the job; for `cancel`, the deleted
    /// ticket. `None` for blacklist actions and for a no-op cancel.
    pub result: Option<UserTicket>,
}

impl JobOutcome {
    fn ticket(action: &'static str, change: Change<UserTicket>) -> Self {
        Self {
            action,
            changed: change.is_applied(),
            result: Some(change.into_inner()),
        }
    }
}

/// Routes decoded jobs to a [`TicketRepository`].
#[derive(Debug, Clone)]
pub struct JobDispatcher<R> {
    repository: R,
}

impl<R> JobDispatcher<R>
where
    R: TicketRepository,
{
    pub fn new(repository: R) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Decode a raw queue body and dispatch it.
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<JobOutcome, JobError> {
        let action = JobAction::decode(payload)?;
        self.dispatch(action).await
    }

    #[instrument(skip_all, fields(action = action.name()))]
    pub async fn dispatch(&self, action: JobAction) -> Result<JobOutcome, JobError> {
        let name = action.name();
        let repo = &self.repository;

        let outcome = match action {
            JobAction::Purchase { user_id, tier_id } => {
                JobOutcome::ticket(name, repo.purchase(user_id, tier_id).await?)
            }
            JobAction::ConfirmPayment { user_id } => {
                JobOutcome::ticket(name, repo.confirm_payment(user_id).await?)
            }
            JobAction::Cancel { user_id } => {
                let change = repo.cancel(user_id).await?;
                JobOutcome {
                    action: name,
                    changed: change.is_applied(),
                    result: change.into_inner(),
                }
            }
            JobAction::UpdateBadge { user_id, badge } => {
                JobOutcome::ticket(name, repo.update_badge(user_id, badge).await?)
            }
            JobAction::Approve { ticket_id, staff_id } => {
                JobOutcome::ticket(name, repo.approve(ticket_id, staff_id).await?)
            }
            JobAction::Deny {
                ticket_id,
                staff_id,
                reason,
            } => JobOutcome::ticket(name, repo.deny(ticket_id, staff_id, &reason).await?),
            JobAction::UpgradeTicket { user_id, tier_id } => {
                JobOutcome::ticket(name, repo.upgrade(user_id, tier_id).await?)
            }
            JobAction::BlacklistUser {
                target_user_id,
                reason,
            } => {
                repo.blacklist(target_user_id, reason.as_deref()).await?;
                JobOutcome {
                    action: name,
                    changed: true,
                    result: None,
                }
            }
            JobAction::UnblacklistUser { target_user_id } => {
                repo.unblacklist(target_user_id).await?;
                JobOutcome {
                    action: name,
                    changed: true,
                    result: None,
                }
            }
        };

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use conreg_core::{TierId, UserId};
    use conreg_tickets::{TicketError, TicketStatus, TicketTier, User};

    use crate::repository::InMemoryTicketRepository;

    async fn setup() -> (JobDispatcher<Arc<InMemoryTicketRepository>>, UserId, TicketTier) {
        let repo = Arc::new(InMemoryTicketRepository::new());
        let user = UserId::new();
        let tier = TicketTier {
            id: TierId::new(),
            code: "REG".to_string(),
            stock: 3,
            price: 6000,
            is_active: true,
            is_deleted: false,
        };
        repo.insert_user(User::new(user)).await;
        repo.insert_tier(tier.clone()).await;
        (JobDispatcher::new(repo), user, tier)
    }

    fn payload(value: serde_json::Value) -> Vec<u8> {
        value.to_string().into_bytes()
    }

    #[tokio::test]
    async fn purchase_then_confirm_through_payloads() {
        let (dispatcher, user, tier) = setup().await;

        let bought = dispatcher
            .handle_payload(&payload(json!({
                "action": "purchase",
                "user_id": user.to_string(),
                "tier_id": tier.id.to_string(),
            })))
            .await
            .unwrap();
        assert!(bought.changed);
        assert_eq!(bought.result.as_ref().unwrap().reference_code, "REG-0001");

        let confirmed = dispatcher
            .handle_payload(&payload(json!({ "action": "confirm_payment", "user_id": user.to_string() })))
            .await
            .unwrap();
        assert!(confirmed.changed);
        assert_eq!(confirmed.result.unwrap().status, TicketStatus::SelfConfirmed);
    }

    #[tokio::test]
    async fn invalid_input_never_reaches_repository() {
        let (dispatcher, _, tier) = setup().await;

        let err = dispatcher
            .handle_payload(&payload(json!({ "action": "purchase", "user_id": "nope", "tier_id": tier.id.to_string() })))
            .await
            .unwrap_err();
        assert!(err.is_input_error());
        assert_eq!(dispatcher.repository().tier(tier.id).await.unwrap().stock, 3);
    }

    #[tokio::test]
    async fn repository_rejections_are_forwarded() {
        let (dispatcher, user, _) = setup().await;
        let missing = TierId::new();
        let err = dispatcher
            .dispatch(JobAction::Purchase { user_id: user, tier_id: missing })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Rule(TicketError::TicketTierNotFound(id)) if id == missing));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn noop_cancel_reports_unchanged() {
        let (dispatcher, user, _) = setup().await;
        let outcome = dispatcher.dispatch(JobAction::Cancel { user_id: user }).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome {
                action: "cancel",
                changed: false,
                result: None
            }
        );
    }
}
