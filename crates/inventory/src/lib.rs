//! Inventory ledger domain module (event-sourced).
//!
//! One `StockLedger` per (tenant, site, ingredient) keeps the batch list and
//! the derived aggregates (quantity on hand, weighted average cost, stock
//! level). Business rules only: no IO, no HTTP, no storage.
//!
//! Negative stock is a normal state. Consuming more than the batches hold
//! records an unbatched deficit, which later receipts absorb first.

pub mod key;
pub mod ledger;
pub mod level;

pub use key::{LedgerKey, StockLedgerId};
pub use ledger::{
    AdjustStock, ConsumeStock, ConsumptionOutcome, ConsumptionReversed, InitializeLedger,
    InventoryCommand, InventoryEvent, InventoryState, LedgerInitialized, LedgerOutcome,
    ReceiptOutcome, ReceiptSource, ReceiveBatch, ReceiveTransfer, ReversalOutcome,
    ReverseConsumption, StockConsumed, StockLedger, StockLevelChanged, StockReceived,
    AGGREGATE_TYPE, RETAINED_OPERATION_KEYS,
};
pub use level::{LevelInfo, StockLevel};
