use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a received stock batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for BatchId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Active,
    Exhausted,
}

/// A received lot of stock with a fixed unit cost.
///
/// Invariants: `0 <= quantity <= original_quantity`; `quantity` only
/// decreases, except when a withdrawal is reversed; the batch is `Exhausted`
/// exactly when `quantity` is zero.
/// Batches are never removed from a ledger (audit trail).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBatch {
    id: BatchId,
    batch_number: String,
    received_at: DateTime<Utc>,
    quantity: Decimal,
    original_quantity: Decimal,
    unit_cost: Decimal,
    total_cost: Decimal,
    status: BatchStatus,
}

impl StockBatch {
    /// A freshly received, active batch. `quantity` must be positive.
    pub fn received(
        id: BatchId,
        batch_number: impl Into<String>,
        received_at: DateTime<Utc>,
        quantity: Decimal,
        unit_cost: Decimal,
    ) -> Self {
        let status = if quantity > Decimal::ZERO {
            BatchStatus::Active
        } else {
            BatchStatus::Exhausted
        };
        let quantity = quantity.max(Decimal::ZERO);
        Self {
            id,
            batch_number: batch_number.into(),
            received_at,
            quantity,
            original_quantity: quantity,
            unit_cost,
            total_cost: quantity * unit_cost,
            status,
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn batch_number(&self) -> &str {
        &self.batch_number
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Remaining quantity.
    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn original_quantity(&self) -> Decimal {
        self.original_quantity
    }

    pub fn unit_cost(&self) -> Decimal {
        self.unit_cost
    }

    /// Cost of the remaining quantity.
    pub fn total_cost(&self) -> Decimal {
        self.total_cost
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == BatchStatus::Active && self.quantity > Decimal::ZERO
    }

    /// Take up to `wanted` units from this batch and return how many were taken.
    pub fn draw(&mut self, wanted: Decimal) -> Decimal {
        if !self.is_active() || wanted <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let taken = wanted.min(self.quantity);
        self.quantity -= taken;
        self.total_cost = self.quantity * self.unit_cost;
        if self.quantity.is_zero() {
            self.status = BatchStatus::Exhausted;
        }
        taken
    }

    /// Put back up to `returned` previously drawn units and return how many
    /// fit under the original quantity.
    pub fn restore(&mut self, returned: Decimal) -> Decimal {
        if returned <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let restored = returned.min(self.original_quantity - self.quantity);
        self.quantity += restored;
        self.total_cost = self.quantity * self.unit_cost;
        if self.quantity > Decimal::ZERO {
            self.status = BatchStatus::Active;
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn draw_caps_at_remaining_and_exhausts() {
        let mut batch = StockBatch::received(BatchId::new(), "B-1", Utc::now(), dec!(10), dec!(2));

        assert_eq!(batch.draw(dec!(4)), dec!(4));
        assert_eq!(batch.quantity(), dec!(6));
        assert_eq!(batch.total_cost(), dec!(12));
        assert_eq!(batch.status(), BatchStatus::Active);

        assert_eq!(batch.draw(dec!(50)), dec!(6));
        assert_eq!(batch.quantity(), dec!(0));
        assert_eq!(batch.original_quantity(), dec!(10));
        assert_eq!(batch.status(), BatchStatus::Exhausted);

        assert_eq!(batch.draw(dec!(1)), dec!(0));
    }

    #[test]
    fn restore_reactivates_and_never_exceeds_original() {
        let mut batch = StockBatch::received(BatchId::new(), "B-1", Utc::now(), dec!(10), dec!(2));
        batch.draw(dec!(10));

        assert_eq!(batch.restore(dec!(3)), dec!(3));
        assert_eq!(batch.status(), BatchStatus::Active);
        assert_eq!(batch.total_cost(), dec!(6));

        assert_eq!(batch.restore(dec!(20)), dec!(7));
        assert_eq!(batch.quantity(), batch.original_quantity());
    }
}
