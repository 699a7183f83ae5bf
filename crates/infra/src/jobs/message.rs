//! Queue message wire format.
//!
//! A job is a flat JSON object: an `action` tag plus optional string / boolean
//! fields. Identifiers are string-encoded UUIDs. Which fields are required
//! depends on the action:
//!
//! | action | required | optional |
//! |--------|----------|----------|
//! | `purchase` | `user_id`, `tier_id` | |
//! | `confirm_payment` | `user_id` | |
//! | `cancel` | `user_id` | |
//! | `update_badge` | `user_id` | `con_badge_name`, `badge_image`, `is_fursuiter`, `is_fursuit_staff` |
//! | `approve` | `ticket_id`, `staff_id` | |
//! | `deny` | `ticket_id`, `staff_id`, `reason` | |
//! | `upgrade_ticket` | `user_id`, `tier_id` | |
//! | `blacklist_user` | `target_user_id` | `reason`, `user_id` (acting admin) |
//! | `unblacklist_user` | `target_user_id` | `user_id` (acting admin) |
//!
//! Unknown fields are ignored so producers can add fields ahead of consumers.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use conreg_core::{IdError, TicketId, TierId, UserId};
use conreg_tickets::Badge;

use super::error::JobError;

/// The raw queue body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staff_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub con_badge_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_fursuiter: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_fursuit_staff: Option<bool>,
}

/// A validated job: exactly one repository operation with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    Purchase { user_id: UserId, tier_id: TierId },
    ConfirmPayment { user_id: UserId },
    Cancel { user_id: UserId },
    UpdateBadge { user_id: UserId, badge: Badge },
    Approve { ticket_id: TicketId, staff_id: UserId },
    Deny { ticket_id: TicketId, staff_id: UserId, reason: String },
    UpgradeTicket { user_id: UserId, tier_id: TierId },
    BlacklistUser { target_user_id: UserId, reason: Option<String> },
    UnblacklistUser { target_user_id: UserId },
}

impl JobAction {
    pub const NAMES: [&'static str; 9] = [
        "purchase",
        "confirm_payment",
        "cancel",
        "update_badge",
        "approve",
        "deny",
        "upgrade_ticket",
        "blacklist_user",
        "unblacklist_user",
    ];

    /// Wire tag of this action.
    pub fn name(&self) -> &'static str {
        match self {
            JobAction::Purchase { .. } => "purchase",
            JobAction::ConfirmPayment { .. } => "confirm_payment",
            JobAction::Cancel { .. } => "cancel",
            JobAction::UpdateBadge { .. } => "update_badge",
            JobAction::Approve { .. } => "approve",
            JobAction::Deny { .. } => "deny",
            JobAction::UpgradeTicket { .. } => "upgrade_ticket",
            JobAction::BlacklistUser { .. } => "blacklist_user",
            JobAction::UnblacklistUser { .. } => "unblacklist_user",
        }
    }

    /// Parse and validate a queue body. Never touches storage.
    pub fn decode(payload: &[u8]) -> Result<Self, JobError> {
        let message: JobMessage = serde_json::from_slice(payload).map_err(JobError::Malformed)?;
        Self::try_from(message)
    }

    /// Serialize to the queue body shape.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_message())
    }

    pub fn to_message(&self) -> JobMessage {
        let mut m = JobMessage {
            action: self.name().to_string(),
            ..JobMessage::default()
        };
        match self {
            JobAction::Purchase { user_id, tier_id } | JobAction::UpgradeTicket { user_id, tier_id } => {
                m.user_id = Some(user_id.to_string());
                m.tier_id = Some(tier_id.to_string());
            }
            JobAction::ConfirmPayment { user_id } | JobAction::Cancel { user_id } => {
                m.user_id = Some(user_id.to_string());
            }
            JobAction::UpdateBadge { user_id, badge } => {
                m.user_id = Some(user_id.to_string());
                m.con_badge_name = badge.con_badge_name.clone();
                m.badge_image = badge.badge_image.clone();
                m.is_fursuiter = Some(badge.is_fursuiter);
                m.is_fursuit_staff = Some(badge.is_fursuit_staff);
            }
            JobAction::Approve { ticket_id, staff_id } => {
                m.ticket_id = Some(ticket_id.to_string());
                m.staff_id = Some(staff_id.to_string());
            }
            JobAction::Deny {
                ticket_id,
                staff_id,
                reason,
            } => {
                m.ticket_id = Some(ticket_id.to_string());
                m.staff_id = Some(staff_id.to_string());
                m.reason = Some(reason.clone());
            }
            JobAction::BlacklistUser {
                target_user_id,
                reason,
            } => {
                m.target_user_id = Some(target_user_id.to_string());
                m.reason = reason.clone();
            }
            JobAction::UnblacklistUser { target_user_id } => {
                m.target_user_id = Some(target_user_id.to_string());
            }
        }
        m
    }
}

impl TryFrom<JobMessage> for JobAction {
    type Error = JobError;

    fn try_from(m: JobMessage) -> Result<Self, JobError> {
        let name = m.action.trim();
        if name.is_empty() {
            return Err(JobError::MissingField {
                action: "job",
                field: "action",
            });
        }
        let Some(action) = JobAction::NAMES.into_iter().find(|n| *n == name) else {
            return Err(JobError::UnknownAction(name.to_string()));
        };
        let fields = Fields { action };

        Ok(match action {
            "purchase" => JobAction::Purchase {
                user_id: fields.id("user_id", &m.user_id)?,
                tier_id: fields.id("tier_id", &m.tier_id)?,
            },
            "confirm_payment" => JobAction::ConfirmPayment {
                user_id: fields.id("user_id", &m.user_id)?,
            },
            "cancel" => JobAction::Cancel {
                user_id: fields.id("user_id", &m.user_id)?,
            },
            "update_badge" => JobAction::UpdateBadge {
                user_id: fields.id("user_id", &m.user_id)?,
                badge: Badge {
                    con_badge_name: m.con_badge_name.clone(),
                    badge_image: m.badge_image.clone(),
                    is_fursuiter: m.is_fursuiter.unwrap_or(false),
                    is_fursuit_staff: m.is_fursuit_staff.unwrap_or(false),
                },
            },
            "approve" => JobAction::Approve {
                ticket_id: fields.id("ticket_id", &m.ticket_id)?,
                staff_id: fields.id("staff_id", &m.staff_id)?,
            },
            "deny" => JobAction::Deny {
                ticket_id: fields.id("ticket_id", &m.ticket_id)?,
                staff_id: fields.id("staff_id", &m.staff_id)?,
                reason: fields.text("reason", &m.reason)?,
            },
            "upgrade_ticket" => JobAction::UpgradeTicket {
                user_id: fields.id("user_id", &m.user_id)?,
                tier_id: fields.id("tier_id", &m.tier_id)?,
            },
            "blacklist_user" => JobAction::BlacklistUser {
                target_user_id: fields.id("target_user_id", &m.target_user_id)?,
                reason: m.reason.clone().filter(|r| !r.trim().is_empty()),
            },
            _ => JobAction::UnblacklistUser {
                target_user_id: fields.id("target_user_id", &m.target_user_id)?,
            },
        })
    }
}

/// Required-field accessors that name the action in their errors.
struct Fields {
    action: &'static str,
}

impl Fields {
    fn id<T>(&self, field: &'static str, value: &Option<String>) -> Result<T, JobError>
    where
        T: FromStr<Err = IdError>,
    {
        let raw = self.text(field, value)?;
        raw.parse::<T>()
            .map_err(|source| JobError::InvalidIdentifier { field, source })
    }

    fn text(&self, field: &'static str, value: &Option<String>) -> Result<String, JobError> {
        match value.as_deref().map(str::trim) {
            Some(v) if !v.is_empty() => Ok(v.to_string()),
            _ => Err(JobError::MissingField {
                action: self.action,
                field,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn decode(value: serde_json::Value) -> Result<JobAction, JobError> {
        JobAction::decode(value.to_string().as_bytes())
    }

    #[test]
    fn decodes_purchase() {
        let user = UserId::new();
        let tier = TierId::new();
        let action = decode(json!({
            "action": "purchase",
            "user_id": user.to_string(),
            "tier_id": tier.to_string(),
            "unrelated": 42,
        }))
        .unwrap();
        assert_eq!(action, JobAction::Purchase { user_id: user, tier_id: tier });
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = decode(json!({ "action": "refund", "user_id": UserId::new().to_string() })).unwrap_err();
        assert!(matches!(err, JobError::UnknownAction(ref a) if a == "refund"));
        assert_eq!(err.code(), "unknown_action");
    }

    #[test]
    fn missing_and_invalid_identifiers_are_input_errors() {
        let missing = decode(json!({ "action": "approve", "ticket_id": TicketId::new().to_string() })).unwrap_err();
        assert!(matches!(
            missing,
            JobError::MissingField { action: "approve", field: "staff_id" }
        ));

        let invalid = decode(json!({ "action": "cancel", "user_id": "not-a-uuid" })).unwrap_err();
        assert!(matches!(invalid, JobError::InvalidIdentifier { field: "user_id", .. }));
        assert_eq!(invalid.code(), "invalid_identifier");
    }

    #[test]
    fn deny_needs_a_reason() {
        let err = decode(json!({
            "action": "deny",
            "ticket_id": TicketId::new().to_string(),
            "staff_id": UserId::new().to_string(),
            "reason": "   ",
        }))
        .unwrap_err();
        assert!(matches!(err, JobError::MissingField { field: "reason", .. }));
    }

    #[test]
    fn blank_blacklist_reason_is_dropped() {
        let target = UserId::new();
        let action = decode(json!({
            "action": "blacklist_user",
            "target_user_id": target.to_string(),
            "reason": "",
        }))
        .unwrap();
        assert_eq!(action, JobAction::BlacklistUser { target_user_id: target, reason: None });
    }

    #[test]
    fn non_json_is_malformed() {
        let err = JobAction::decode(b"action=purchase").unwrap_err();
        assert_eq!(err.code(), "malformed_message");

        let err = JobAction::decode(br#"{"action": "cancel", "is_fursuiter": "yes"}"#).unwrap_err();
        assert_eq!(err.code(), "malformed_message");
    }

    #[test]
    fn missing_action_is_reported() {
        let err = decode(json!({ "user_id": UserId::new().to_string() })).unwrap_err();
        assert!(matches!(err, JobError::MissingField { field: "action", .. }));
    }

    #[test]
    fn encoded_message_omits_unused_fields() {
        let action = JobAction::Cancel { user_id: UserId::new() };
        let value: serde_json::Value = serde_json::from_slice(&action.encode().unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["action"], "cancel");
    }

    fn any_action() -> impl Strategy<Value = JobAction> {
        let id = any::<u128>().prop_map(uuid::Uuid::from_u128);
        let text = "[a-zA-Z][a-zA-Z ]{0,15}[a-zA-Z]";
        prop_oneof![
            (id.clone(), id.clone()).prop_map(|(u, t)| JobAction::Purchase { user_id: u.into(), tier_id: t.into() }),
            id.clone().prop_map(|u| JobAction::ConfirmPayment { user_id: u.into() }),
            id.clone().prop_map(|u| JobAction::Cancel { user_id: u.into() }),
            (id.clone(), proptest::option::of(text), any::<bool>(), any::<bool>()).prop_map(|(u, name, f, s)| {
                JobAction::UpdateBadge {
                    user_id: u.into(),
                    badge: Badge {
                        con_badge_name: name,
                        badge_image: None,
                        is_fursuiter: f,
                        is_fursuit_staff: s,
                    },
                }
            }),
            (id.clone(), id.clone()).prop_map(|(t, s)| JobAction::Approve { ticket_id: t.into(), staff_id: s.into() }),
            (id.clone(), id.clone(), text).prop_map(|(t, s, r)| JobAction::Deny {
                ticket_id: t.into(),
                staff_id: s.into(),
                reason: r,
            }),
            (id.clone(), id.clone()).prop_map(|(u, t)| JobAction::UpgradeTicket { user_id: u.into(), tier_id: t.into() }),
            (id.clone(), proptest::option::of(text)).prop_map(|(u, r)| JobAction::BlacklistUser {
                target_user_id: u.into(),
                reason: r,
            }),
            id.prop_map(|u| JobAction::UnblacklistUser { target_user_id: u.into() }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        // Producer and consumer share this codec; anything the producer can
        // emit the consumer must read back unchanged.
        #[test]
        fn producer_output_is_consumer_input(action in any_action()) {
            let bytes = action.encode().unwrap();
            prop_assert_eq!(JobAction::decode(&bytes).unwrap(), action);
        }
    }
}
