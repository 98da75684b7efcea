//! Weighted-average costing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::batch::StockBatch;
use crate::method::CostingMethod;
use crate::policy::CostingPolicy;
use crate::result::CostingResult;

/// Blended unit cost over every active batch; order-independent.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedAverageCosting;

impl WeightedAverageCosting {
    /// `Σ(qty × unit_cost) / Σ(qty)` over active batches, or zero when there is
    /// no active stock.
    pub fn average_unit_cost(batches: &[StockBatch]) -> Decimal {
        let (quantity, value) = batches
            .iter()
            .filter(|b| b.is_active())
            .fold((Decimal::ZERO, Decimal::ZERO), |(q, v), b| {
                (q + b.quantity(), v + b.quantity() * b.unit_cost())
            });
        if quantity > Decimal::ZERO {
            value / quantity
        } else {
            Decimal::ZERO
        }
    }
}

impl CostingPolicy for WeightedAverageCosting {
    fn method(&self) -> CostingMethod {
        CostingMethod::WeightedAverage
    }

    fn calculate_cost(
        &self,
        batches: &[StockBatch],
        quantity: Decimal,
        unit: &str,
        as_of: DateTime<Utc>,
    ) -> CostingResult {
        CostingResult::flat(
            CostingMethod::WeightedAverage,
            quantity.max(Decimal::ZERO),
            unit,
            Self::average_unit_cost(batches),
            as_of,
        )
    }
}

/// Running average after adding `new_qty` units at `new_unit_cost` to
/// `existing_qty` units valued at `existing_wac`.
///
/// Returns `existing_wac` when the combined quantity is not positive.
pub fn new_wac(
    existing_qty: Decimal,
    existing_wac: Decimal,
    new_qty: Decimal,
    new_unit_cost: Decimal,
) -> Decimal {
    let total = existing_qty + new_qty;
    if total <= Decimal::ZERO {
        return existing_wac;
    }
    (existing_qty * existing_wac + new_qty * new_unit_cost) / total
}
