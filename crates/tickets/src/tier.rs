use conreg_core::TierId;
use serde::{Deserialize, Serialize};

use crate::error::TicketError;

/// Format a human-readable reference code: `{TierCode}-{sequence:04}`.
pub fn reference_code(tier_code: &str, sequence: i32) -> String {
    format!("{tier_code}-{sequence:04}")
}

/// A purchasable ticket class with a price and finite stock.
///
/// `price` is in minor currency units. `stock` never goes below zero: the only
/// way to decrement it is [`TicketTier::take_one`], which refuses at zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketTier {
    pub id: TierId,
    pub code: String,
    pub stock: i32,
    pub price: i64,
    pub is_active: bool,
    pub is_deleted: bool,
}

impl TicketTier {
    /// Active and not soft-deleted.
    pub fn is_on_sale(&self) -> bool {
        self.is_active && !self.is_deleted
    }

    /// Can one more ticket be issued from this tier right now?
    pub fn ensure_available(&self) -> Result<(), TicketError> {
        if !self.is_on_sale() {
            return Err(TicketError::TicketTierNotFound(self.id));
        }
        if self.stock <= 0 {
            return Err(TicketError::OutOfStock(self.id));
        }
        Ok(())
    }

    pub fn take_one(&mut self) -> Result<(), TicketError> {
        self.ensure_available()?;
        self.stock -= 1;
        Ok(())
    }

    /// Return one unit to stock (cancel, deny, or upgrading away from this tier).
    pub fn restock_one(&mut self) {
        self.stock += 1;
    }

    pub fn reference_code(&self, sequence: i32) -> String {
        reference_code(&self.code, sequence)
    }
}
