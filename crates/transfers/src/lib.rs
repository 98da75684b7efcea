//! Inter-site transfer domain module (event-sourced).
//!
//! The transfer aggregate only records lifecycle facts. Moving stock between
//! ledgers is the coordinator's job in `larder-infra`; it feeds the outcomes
//! back here as `RecordShipment` / `RecordShipFailure` commands.

pub mod transfer;

pub use transfer::{
    ApproveTransfer, CancelTransfer, FinalizeReceipt, ItemReceived, ReceiveItem, RecordShipFailure,
    RecordShipment, RejectTransfer, RequestTransfer, ShipmentAttemptFailed, ShippedLine,
    TransferApproved, TransferCancelled, TransferCommand, TransferEvent, TransferId,
    TransferKey, TransferLine, TransferLineRequest, TransferReceived, TransferRejected,
    TransferRequested, TransferShipped, TransferState, TransferStatus, TransferVariance, InventoryTransfer,
    AGGREGATE_TYPE,
};
