//! Costing policy engine (pure, stateless).
//!
//! Assigns a monetary cost to withdrawing a quantity from a list of stock
//! batches. Four interchangeable methods share one contract:
//!
//! - **FIFO** / **LIFO**: walk active batches by reception date (oldest or
//!   newest first) and report a per-batch breakdown.
//! - **Weighted average**: one blended unit cost over all active batches.
//! - **Standard**: an externally supplied price, falling back to the most
//!   recently received batch.
//!
//! Nothing here mutates or stores state, so policies can be shared freely
//! across threads and actors.

pub mod batch;
pub mod layered;
pub mod method;
pub mod policy;
pub mod result;
pub mod standard;
pub mod weighted_average;

pub use batch::{BatchId, BatchStatus, StockBatch};
pub use layered::{BatchDraw, FifoCosting, LifoCosting};
pub use method::CostingMethod;
pub use policy::{CostingPolicy, CostingPolicyFactory};
pub use result::{BatchCost, CostingResult};
pub use standard::{StandardCostLookup, StandardCosting};
pub use weighted_average::{WeightedAverageCosting, new_wac};
