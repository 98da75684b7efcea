use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::method::CostingMethod;

/// Portion of a withdrawal served by one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCost {
    pub batch_number: String,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
}

impl BatchCost {
    pub fn total_cost(&self) -> Decimal {
        self.quantity * self.unit_cost
    }
}

/// Cost of a withdrawal. Produced per call, never persisted.
///
/// For FIFO/LIFO `quantity` is what the batches could actually serve, which
/// may be less than requested; any shortfall carries no cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostingResult {
    pub quantity: Decimal,
    pub unit: String,
    pub method: CostingMethod,
    /// Per-batch breakdown (FIFO/LIFO only).
    pub batch_breakdown: Vec<BatchCost>,
    pub unit_cost: Decimal,
    pub total_cost: Decimal,
    pub as_of: DateTime<Utc>,
}

impl CostingResult {
    /// Result for a method that yields one blended unit cost.
    pub fn flat(
        method: CostingMethod,
        quantity: Decimal,
        unit: &str,
        unit_cost: Decimal,
        as_of: DateTime<Utc>,
    ) -> Self {
        Self {
            quantity,
            unit: unit.to_string(),
            method,
            batch_breakdown: Vec::new(),
            unit_cost,
            total_cost: quantity * unit_cost,
            as_of,
        }
    }

    /// Result assembled from a per-batch breakdown.
    pub fn layered(
        method: CostingMethod,
        breakdown: Vec<BatchCost>,
        unit: &str,
        as_of: DateTime<Utc>,
    ) -> Self {
        let quantity: Decimal = breakdown.iter().map(|b| b.quantity).sum();
        let total_cost: Decimal = breakdown.iter().map(BatchCost::total_cost).sum();
        let unit_cost = if quantity > Decimal::ZERO {
            total_cost / quantity
        } else {
            Decimal::ZERO
        };
        Self {
            quantity,
            unit: unit.to_string(),
            method,
            batch_breakdown: breakdown,
            unit_cost,
            total_cost,
            as_of,
        }
    }
}
