use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use larder_core::IngredientId;

use crate::batch::StockBatch;
use crate::layered::{FifoCosting, LifoCosting};
use crate::method::CostingMethod;
use crate::result::CostingResult;
use crate::standard::{StandardCostLookup, StandardCosting};
use crate::weighted_average::WeightedAverageCosting;

/// One costing method.
///
/// Implementations are pure: they read `batches` and never mutate them.
/// Exhausted or zero-quantity batches are ignored by every method except the
/// standard-cost fallback, which only needs the latest reception price.
pub trait CostingPolicy: Send + Sync {
    fn method(&self) -> CostingMethod;

    fn calculate_cost(
        &self,
        batches: &[StockBatch],
        quantity: Decimal,
        unit: &str,
        as_of: DateTime<Utc>,
    ) -> CostingResult;
}

/// Builds the policy for a method.
///
/// The standard-cost price book is injected here so callers never depend on
/// the collaborator that owns standard prices.
#[derive(Clone, Default)]
pub struct CostingPolicyFactory {
    lookup: Option<Arc<dyn StandardCostLookup>>,
}

impl core::fmt::Debug for CostingPolicyFactory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CostingPolicyFactory")
            .field("has_lookup", &self.lookup.is_some())
            .finish()
    }
}

impl CostingPolicyFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_standard_costs(mut self, lookup: Arc<dyn StandardCostLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Policy for `method`. `ingredient_id` keys the standard-cost lookup and
    /// is ignored by the other methods.
    pub fn create(
        &self,
        method: CostingMethod,
        ingredient_id: IngredientId,
    ) -> Box<dyn CostingPolicy> {
        match method {
            CostingMethod::Fifo => Box::new(FifoCosting),
            CostingMethod::Lifo => Box::new(LifoCosting),
            CostingMethod::WeightedAverage => Box::new(WeightedAverageCosting),
            CostingMethod::Standard => {
                let policy = StandardCosting::new(ingredient_id);
                match &self.lookup {
                    Some(lookup) => Box::new(policy.with_lookup(lookup.clone())),
                    None => Box::new(policy),
                }
            }
        }
    }
}
