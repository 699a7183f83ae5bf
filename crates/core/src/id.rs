//! Strongly-typed identifiers used across the ticketing domain.
//!
//! Every identifier that crosses the queue boundary is a string-encoded UUID.
//! Parsing goes through `FromStr`, so a malformed value is rejected before any
//! repository is touched.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdError;

/// Identifier of a registered user (attendee or staff member).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

/// Identifier of a purchased ticket row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(Uuid);

/// Identifier of a ticket tier (purchasable ticket class).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s.trim()).map_err(|e| IdError::Malformed {
                    kind: $name,
                    value: s.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(UserId, "UserId");
impl_uuid_newtype!(TicketId, "TicketId");
impl_uuid_newtype!(TierId, "TierId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_uuid() {
        let raw = "0190a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b";
        let id: TierId = raw.parse().unwrap();
        assert_eq!(id.to_string(), raw);
    }

    #[test]
    fn rejects_malformed_uuid_with_kind() {
        let err = "not-a-uuid".parse::<UserId>().unwrap_err();
        match err {
            IdError::Malformed { kind, value, .. } => {
                assert_eq!(kind, "UserId");
                assert_eq!(value, "not-a-uuid");
            }
        }
    }

    #[test]
    fn ordering_follows_uuid_bytes() {
        let a = TierId::from_uuid(Uuid::from_u128(1));
        let b = TierId::from_uuid(Uuid::from_u128(2));
        assert!(a < b);
    }
}
