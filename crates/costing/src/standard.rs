//! Standard costing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use larder_core::IngredientId;

use crate::batch::StockBatch;
use crate::method::CostingMethod;
use crate::policy::CostingPolicy;
use crate::result::CostingResult;

/// Source of standard (price-book) unit costs.
pub trait StandardCostLookup: Send + Sync {
    fn standard_cost(&self, ingredient_id: IngredientId) -> Option<Decimal>;
}

impl<F> StandardCostLookup for F
where
    F: Fn(IngredientId) -> Option<Decimal> + Send + Sync,
{
    fn standard_cost(&self, ingredient_id: IngredientId) -> Option<Decimal> {
        self(ingredient_id)
    }
}

/// Values withdrawals at a standard unit cost.
///
/// Without a lookup, or when the lookup has no price for the ingredient, the
/// unit cost of the most recently received batch is used (any status: the
/// price of the last delivery stays meaningful after it is used up).
#[derive(Clone)]
pub struct StandardCosting {
    ingredient_id: IngredientId,
    lookup: Option<Arc<dyn StandardCostLookup>>,
}

impl core::fmt::Debug for StandardCosting {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StandardCosting")
            .field("ingredient_id", &self.ingredient_id)
            .field("has_lookup", &self.lookup.is_some())
            .finish()
    }
}

impl StandardCosting {
    pub fn new(ingredient_id: IngredientId) -> Self {
        Self {
            ingredient_id,
            lookup: None,
        }
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn StandardCostLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    fn unit_cost(&self, batches: &[StockBatch]) -> Decimal {
        self.lookup
            .as_ref()
            .and_then(|lookup| lookup.standard_cost(self.ingredient_id))
            .or_else(|| {
                batches
                    .iter()
                    .max_by_key(|b| b.received_at())
                    .map(StockBatch::unit_cost)
            })
            .unwrap_or(Decimal::ZERO)
    }
}

impl CostingPolicy for StandardCosting {
    fn method(&self) -> CostingMethod {
        CostingMethod::Standard
    }

    fn calculate_cost(
        &self,
        batches: &[StockBatch],
        quantity: Decimal,
        unit: &str,
        as_of: DateTime<Utc>,
    ) -> CostingResult {
        CostingResult::flat(
            CostingMethod::Standard,
            quantity.max(Decimal::ZERO),
            unit,
            self.unit_cost(batches),
            as_of,
        )
    }
}
