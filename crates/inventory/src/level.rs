use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Coarse stock classification used for reorder alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockLevel {
    Normal,
    Low,
    OutOfStock,
}

impl StockLevel {
    /// `OutOfStock` at or below zero, `Low` at or below the reorder point
    /// (inclusive), otherwise `Normal`.
    pub fn classify(available: Decimal, reorder_point: Decimal) -> Self {
        if available <= Decimal::ZERO {
            StockLevel::OutOfStock
        } else if available <= reorder_point {
            StockLevel::Low
        } else {
            StockLevel::Normal
        }
    }
}

/// Point-in-time level summary of one ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelInfo {
    pub quantity_on_hand: Decimal,
    pub quantity_available: Decimal,
    pub unbatched_deficit: Decimal,
    pub reorder_point: Decimal,
    pub par_level: Decimal,
    pub weighted_average_cost: Decimal,
    pub level: StockLevel,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn reorder_point_boundary_is_low() {
        assert_eq!(StockLevel::classify(dec!(10), dec!(10)), StockLevel::Low);
        assert_eq!(StockLevel::classify(dec!(10.01), dec!(10)), StockLevel::Normal);
    }

    #[test]
    fn zero_and_negative_are_out_of_stock() {
        assert_eq!(StockLevel::classify(dec!(0), dec!(10)), StockLevel::OutOfStock);
        assert_eq!(StockLevel::classify(dec!(-5), dec!(0)), StockLevel::OutOfStock);
    }
}
