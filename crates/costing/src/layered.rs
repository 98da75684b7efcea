//! FIFO and LIFO: cost layers consumed in reception order.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::batch::{BatchId, StockBatch};
use crate::method::CostingMethod;
use crate::policy::CostingPolicy;
use crate::result::{BatchCost, CostingResult};

/// Units drawn from one batch by a layered walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDraw {
    pub batch_id: BatchId,
    pub batch_number: String,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
}

impl From<&BatchDraw> for BatchCost {
    fn from(draw: &BatchDraw) -> Self {
        BatchCost {
            batch_number: draw.batch_number.clone(),
            quantity: draw.quantity,
            unit_cost: draw.unit_cost,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    OldestFirst,
    NewestFirst,
}

/// Greedy walk over active batches. Ties on reception date keep list order
/// (the sort is stable), so batches received in the same instant are drawn in
/// the order they were recorded.
fn draw_plan(batches: &[StockBatch], quantity: Decimal, direction: Direction) -> Vec<BatchDraw> {
    let mut layers: Vec<&StockBatch> = batches.iter().filter(|b| b.is_active()).collect();
    match direction {
        Direction::OldestFirst => layers.sort_by_key(|b| b.received_at()),
        Direction::NewestFirst => layers.sort_by(|a, b| b.received_at().cmp(&a.received_at())),
    }

    let mut remaining = quantity.max(Decimal::ZERO);
    let mut plan = Vec::new();
    for batch in layers {
        if remaining.is_zero() {
            break;
        }
        let taken = remaining.min(batch.quantity());
        remaining -= taken;
        plan.push(BatchDraw {
            batch_id: batch.id(),
            batch_number: batch.batch_number().to_string(),
            quantity: taken,
            unit_cost: batch.unit_cost(),
        });
    }
    plan
}

/// First-in, first-out.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoCosting;

impl FifoCosting {
    /// Batches to draw from (oldest first) to serve `quantity`. The plan may
    /// cover less than requested when stock is short.
    pub fn draw_plan(batches: &[StockBatch], quantity: Decimal) -> Vec<BatchDraw> {
        draw_plan(batches, quantity, Direction::OldestFirst)
    }
}

impl CostingPolicy for FifoCosting {
    fn method(&self) -> CostingMethod {
        CostingMethod::Fifo
    }

    fn calculate_cost(
        &self,
        batches: &[StockBatch],
        quantity: Decimal,
        unit: &str,
        as_of: DateTime<Utc>,
    ) -> CostingResult {
        let plan = Self::draw_plan(batches, quantity);
        CostingResult::layered(
            CostingMethod::Fifo,
            plan.iter().map(BatchCost::from).collect(),
            unit,
            as_of,
        )
    }
}

/// Last-in, first-out.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifoCosting;

impl LifoCosting {
    pub fn draw_plan(batches: &[StockBatch], quantity: Decimal) -> Vec<BatchDraw> {
        draw_plan(batches, quantity, Direction::NewestFirst)
    }
}

impl CostingPolicy for LifoCosting {
    fn method(&self) -> CostingMethod {
        CostingMethod::Lifo
    }

    fn calculate_cost(
        &self,
        batches: &[StockBatch],
        quantity: Decimal,
        unit: &str,
        as_of: DateTime<Utc>,
    ) -> CostingResult {
        let plan = Self::draw_plan(batches, quantity);
        CostingResult::layered(
            CostingMethod::Lifo,
            plan.iter().map(BatchCost::from).collect(),
            unit,
            as_of,
        )
    }
}
