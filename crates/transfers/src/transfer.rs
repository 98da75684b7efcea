use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use larder_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, IngredientId, SiteId, TenantId, UserId,
};
use larder_events::Event;

/// Aggregate type name used for event streams and actor addressing.
pub const AGGREGATE_TYPE: &str = "inventory.transfer";

/// Transfer identifier; doubles as the stream id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub AggregateId);

impl TransferId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for TransferId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Address of a transfer actor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferKey {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
}

impl TransferKey {
    pub fn new(tenant_id: TenantId, transfer_id: TransferId) -> Self {
        Self {
            tenant_id,
            transfer_id,
        }
    }

    /// Idempotency key for one cross-actor step on one line.
    pub fn operation_key(&self, line_no: u32, step: &str) -> String {
        format!("transfer:{}:line:{}:{}", self.transfer_id, line_no, step)
    }
}

impl core::fmt::Display for TransferKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.transfer_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Requested,
    Approved,
    Rejected,
    Shipped,
    Received,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Received | TransferStatus::Rejected | TransferStatus::Cancelled
        )
    }
}

/// Requested movement of one ingredient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLineRequest {
    pub ingredient_id: IngredientId,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLine {
    pub line_no: u32,
    pub ingredient_id: IngredientId,
    pub requested_qty: Decimal,
    pub shipped_qty: Decimal,
    pub received_qty: Decimal,
    /// Per-unit cost credited to the destination.
    pub shipped_unit_cost: Decimal,
    /// Exact FIFO cost of what left the source.
    pub shipped_value: Decimal,
}

/// What left the source site for one line.
///
/// `value` is the cost the source ledger reported for the withdrawal;
/// `unit_cost` is derived from it and only used to credit the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippedLine {
    pub line_no: u32,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub value: Decimal,
}

/// Received-versus-shipped discrepancy on one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferVariance {
    pub line_no: u32,
    pub ingredient_id: IngredientId,
    pub shipped_qty: Decimal,
    pub received_qty: Decimal,
    /// `received - shipped`; negative means stock went missing in transit.
    pub variance: Decimal,
    pub condition: Option<String>,
    pub notes: Option<String>,
}

/// Aggregate root: InventoryTransfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryTransfer {
    id: TransferId,
    tenant_id: Option<TenantId>,
    source_site_id: Option<SiteId>,
    dest_site_id: Option<SiteId>,
    status: TransferStatus,
    lines: Vec<TransferLine>,
    variances: Vec<TransferVariance>,
    total_shipped_value: Decimal,
    stock_returned_to_source: bool,
    ship_attempts: u32,

    requested_by: Option<UserId>,
    requested_at: Option<DateTime<Utc>>,
    approved_by: Option<UserId>,
    approved_at: Option<DateTime<Utc>>,
    rejected_by: Option<UserId>,
    rejection_reason: Option<String>,
    shipped_by: Option<UserId>,
    shipped_at: Option<DateTime<Utc>>,
    tracking_number: Option<String>,
    received_by: Option<UserId>,
    received_at: Option<DateTime<Utc>>,
    cancelled_by: Option<UserId>,
    cancelled_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,

    version: u64,
    created: bool,
}

/// Serializable view of a transfer (GetState).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    pub key: TransferKey,
    pub source_site_id: SiteId,
    pub dest_site_id: SiteId,
    pub status: TransferStatus,
    pub lines: Vec<TransferLine>,
    pub variances: Vec<TransferVariance>,
    pub total_shipped_value: Decimal,
    pub stock_returned_to_source: bool,
    pub ship_attempts: u32,
    pub requested_by: Option<UserId>,
    pub requested_at: Option<DateTime<Utc>>,
    pub approved_by: Option<UserId>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<UserId>,
    pub rejection_reason: Option<String>,
    pub shipped_by: Option<UserId>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub tracking_number: Option<String>,
    pub received_by: Option<UserId>,
    pub received_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<UserId>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub version: u64,
}

impl InventoryTransfer {
    /// Create an empty, not-yet-requested aggregate instance for rehydration.
    pub fn empty(id: TransferId) -> Self {
        Self {
            id,
            tenant_id: None,
            source_site_id: None,
            dest_site_id: None,
            status: TransferStatus::Requested,
            lines: Vec::new(),
            variances: Vec::new(),
            total_shipped_value: Decimal::ZERO,
            stock_returned_to_source: false,
            ship_attempts: 0,
            requested_by: None,
            requested_at: None,
            approved_by: None,
            approved_at: None,
            rejected_by: None,
            rejection_reason: None,
            shipped_by: None,
            shipped_at: None,
            tracking_number: None,
            received_by: None,
            received_at: None,
            cancelled_by: None,
            cancelled_at: None,
            cancel_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> TransferId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn is_requested(&self) -> bool {
        self.created
    }

    pub fn source_site_id(&self) -> Option<SiteId> {
        self.source_site_id
    }

    pub fn dest_site_id(&self) -> Option<SiteId> {
        self.dest_site_id
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn lines(&self) -> &[TransferLine] {
        &self.lines
    }

    pub fn variances(&self) -> &[TransferVariance] {
        &self.variances
    }

    pub fn total_shipped_value(&self) -> Decimal {
        self.total_shipped_value
    }

    pub fn stock_returned_to_source(&self) -> bool {
        self.stock_returned_to_source
    }

    pub fn ship_attempts(&self) -> u32 {
        self.ship_attempts
    }

    /// Attempt number the next Ship will use. Each attempt gets fresh
    /// idempotency keys so a compensated attempt is never mistaken for a
    /// completed one.
    pub fn next_ship_attempt(&self) -> u32 {
        self.ship_attempts + 1
    }

    /// Lifecycle precondition checks, usable before any cross-actor work.
    pub fn ensure_can_ship(&self) -> Result<(), DomainError> {
        self.ensure_status("ship", &[TransferStatus::Approved])
    }

    pub fn ensure_can_finalize(&self) -> Result<(), DomainError> {
        self.ensure_status("finalize receipt", &[TransferStatus::Shipped])
    }

    pub fn ensure_can_cancel(&self) -> Result<(), DomainError> {
        self.ensure_status("cancel", &[TransferStatus::Approved, TransferStatus::Shipped])
    }

    pub fn snapshot(&self) -> Option<TransferState> {
        let key = TransferKey::new(self.tenant_id?, self.id);
        Some(TransferState {
            key,
            source_site_id: self.source_site_id?,
            dest_site_id: self.dest_site_id?,
            status: self.status,
            lines: self.lines.clone(),
            variances: self.variances.clone(),
            total_shipped_value: self.total_shipped_value,
            stock_returned_to_source: self.stock_returned_to_source,
            ship_attempts: self.ship_attempts,
            requested_by: self.requested_by,
            requested_at: self.requested_at,
            approved_by: self.approved_by,
            approved_at: self.approved_at,
            rejected_by: self.rejected_by,
            rejection_reason: self.rejection_reason.clone(),
            shipped_by: self.shipped_by,
            shipped_at: self.shipped_at,
            tracking_number: self.tracking_number.clone(),
            received_by: self.received_by,
            received_at: self.received_at,
            cancelled_by: self.cancelled_by,
            cancelled_at: self.cancelled_at,
            cancel_reason: self.cancel_reason.clone(),
            version: self.version,
        })
    }

    fn ensure_status(&self, operation: &str, allowed: &[TransferStatus]) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if !allowed.contains(&self.status) {
            return Err(DomainError::state_conflict(operation, self.status));
        }
        Ok(())
    }
}

impl AggregateRoot for InventoryTransfer {
    type Id = TransferId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RequestTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTransfer {
    pub key: TransferKey,
    pub source_site_id: SiteId,
    pub dest_site_id: SiteId,
    pub lines: Vec<TransferLineRequest>,
    pub requested_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApproveTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveTransfer {
    pub key: TransferKey,
    pub by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RejectTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectTransfer {
    pub key: TransferKey,
    pub by: UserId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordShipment (issued by the coordinator after every line was
/// deducted from the source ledger).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordShipment {
    pub key: TransferKey,
    pub attempt: u32,
    pub by: UserId,
    pub tracking_number: Option<String>,
    pub lines: Vec<ShippedLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordShipFailure (issued by the coordinator after compensating a
/// failed attempt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordShipFailure {
    pub key: TransferKey,
    pub attempt: u32,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReceiveItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveItem {
    pub key: TransferKey,
    pub ingredient_id: IngredientId,
    pub received_qty: Decimal,
    pub by: UserId,
    pub condition: Option<String>,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FinalizeReceipt (issued by the coordinator after the destination
/// ledger was credited).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeReceipt {
    pub key: TransferKey,
    pub by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTransfer {
    pub key: TransferKey,
    pub by: UserId,
    pub reason: String,
    pub return_stock_to_source: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferCommand {
    Request(RequestTransfer),
    Approve(ApproveTransfer),
    Reject(RejectTransfer),
    RecordShipment(RecordShipment),
    RecordShipFailure(RecordShipFailure),
    ReceiveItem(ReceiveItem),
    FinalizeReceipt(FinalizeReceipt),
    Cancel(CancelTransfer),
}

impl TransferCommand {
    pub fn key(&self) -> TransferKey {
        match self {
            TransferCommand::Request(c) => c.key,
            TransferCommand::Approve(c) => c.key,
            TransferCommand::Reject(c) => c.key,
            TransferCommand::RecordShipment(c) => c.key,
            TransferCommand::RecordShipFailure(c) => c.key,
            TransferCommand::ReceiveItem(c) => c.key,
            TransferCommand::FinalizeReceipt(c) => c.key,
            TransferCommand::Cancel(c) => c.key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequested {
    pub key: TransferKey,
    pub source_site_id: SiteId,
    pub dest_site_id: SiteId,
    pub lines: Vec<TransferLine>,
    pub requested_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferApproved {
    pub key: TransferKey,
    pub by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRejected {
    pub key: TransferKey,
    pub by: UserId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentAttemptFailed {
    pub key: TransferKey,
    pub attempt: u32,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferShipped {
    pub key: TransferKey,
    pub attempt: u32,
    pub by: UserId,
    pub tracking_number: Option<String>,
    pub lines: Vec<ShippedLine>,
    pub total_value: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReceived {
    pub key: TransferKey,
    pub variance: TransferVariance,
    pub by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceived {
    pub key: TransferKey,
    pub by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCancelled {
    pub key: TransferKey,
    pub by: UserId,
    pub reason: String,
    pub stock_returned: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferEvent {
    Requested(TransferRequested),
    Approved(TransferApproved),
    Rejected(TransferRejected),
    ShipmentAttemptFailed(ShipmentAttemptFailed),
    Shipped(TransferShipped),
    ItemReceived(ItemReceived),
    Received(TransferReceived),
    Cancelled(TransferCancelled),
}

impl Event for TransferEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TransferEvent::Requested(_) => "inventory.transfer.requested",
            TransferEvent::Approved(_) => "inventory.transfer.approved",
            TransferEvent::Rejected(_) => "inventory.transfer.rejected",
            TransferEvent::ShipmentAttemptFailed(_) => "inventory.transfer.ship_attempt_failed",
            TransferEvent::Shipped(_) => "inventory.transfer.shipped",
            TransferEvent::ItemReceived(_) => "inventory.transfer.item_received",
            TransferEvent::Received(_) => "inventory.transfer.received",
            TransferEvent::Cancelled(_) => "inventory.transfer.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TransferEvent::Requested(e) => e.occurred_at,
            TransferEvent::Approved(e) => e.occurred_at,
            TransferEvent::Rejected(e) => e.occurred_at,
            TransferEvent::ShipmentAttemptFailed(e) => e.occurred_at,
            TransferEvent::Shipped(e) => e.occurred_at,
            TransferEvent::ItemReceived(e) => e.occurred_at,
            TransferEvent::Received(e) => e.occurred_at,
            TransferEvent::Cancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for InventoryTransfer {
    type Command = TransferCommand;
    type Event = TransferEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            TransferEvent::Requested(e) => {
                self.tenant_id = Some(e.key.tenant_id);
                self.source_site_id = Some(e.source_site_id);
                self.dest_site_id = Some(e.dest_site_id);
                self.lines = e.lines.clone();
                self.status = TransferStatus::Requested;
                self.requested_by = Some(e.requested_by);
                self.requested_at = Some(e.occurred_at);
                self.created = true;
            }
            TransferEvent::Approved(e) => {
                self.status = TransferStatus::Approved;
                self.approved_by = Some(e.by);
                self.approved_at = Some(e.occurred_at);
            }
            TransferEvent::Rejected(e) => {
                self.status = TransferStatus::Rejected;
                self.rejected_by = Some(e.by);
                self.rejection_reason = Some(e.reason.clone());
            }
            TransferEvent::ShipmentAttemptFailed(e) => {
                self.ship_attempts = self.ship_attempts.max(e.attempt);
            }
            TransferEvent::Shipped(e) => {
                for shipped in &e.lines {
                    if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == shipped.line_no)
                    {
                        line.shipped_qty = shipped.quantity;
                        line.shipped_unit_cost = shipped.unit_cost;
                        line.shipped_value = shipped.value;
                    }
                }
                self.total_shipped_value = e.total_value;
                self.ship_attempts = self.ship_attempts.max(e.attempt);
                self.status = TransferStatus::Shipped;
                self.shipped_by = Some(e.by);
                self.shipped_at = Some(e.occurred_at);
                self.tracking_number = e.tracking_number.clone();
            }
            TransferEvent::ItemReceived(e) => {
                if let Some(line) = self
                    .lines
                    .iter_mut()
                    .find(|l| l.line_no == e.variance.line_no)
                {
                    line.received_qty = e.variance.received_qty;
                }
                // A recount replaces the earlier variance for the line.
                self.variances.retain(|v| v.line_no != e.variance.line_no);
                self.variances.push(e.variance.clone());
            }
            TransferEvent::Received(e) => {
                self.status = TransferStatus::Received;
                self.received_by = Some(e.by);
                self.received_at = Some(e.occurred_at);
            }
            TransferEvent::Cancelled(e) => {
                self.status = TransferStatus::Cancelled;
                self.stock_returned_to_source = e.stock_returned;
                self.cancelled_by = Some(e.by);
                self.cancelled_at = Some(e.occurred_at);
                self.cancel_reason = Some(e.reason.clone());
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            TransferCommand::Request(cmd) => self.handle_request(cmd),
            TransferCommand::Approve(cmd) => self.handle_approve(cmd),
            TransferCommand::Reject(cmd) => self.handle_reject(cmd),
            TransferCommand::RecordShipment(cmd) => self.handle_record_shipment(cmd),
            TransferCommand::RecordShipFailure(cmd) => self.handle_record_ship_failure(cmd),
            TransferCommand::ReceiveItem(cmd) => self.handle_receive_item(cmd),
            TransferCommand::FinalizeReceipt(cmd) => self.handle_finalize(cmd),
            TransferCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl InventoryTransfer {
    pub fn ensure_key(&self, key: TransferKey) -> Result<(), DomainError> {
        if key.transfer_id != self.id {
            return Err(DomainError::invariant("transfer_id mismatch"));
        }
        match self.tenant_id {
            Some(t) if t != key.tenant_id => Err(DomainError::invariant("tenant mismatch")),
            _ => Ok(()),
        }
    }

    fn handle_request(&self, cmd: &RequestTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("transfer already requested"));
        }
        self.ensure_key(cmd.key)?;
        if cmd.source_site_id == cmd.dest_site_id {
            return Err(DomainError::validation(
                "source and destination sites must differ",
            ));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("transfer needs at least one line"));
        }

        let mut seen = HashSet::new();
        let mut lines = Vec::with_capacity(cmd.lines.len());
        for (idx, requested) in cmd.lines.iter().enumerate() {
            if requested.quantity <= Decimal::ZERO {
                return Err(DomainError::validation("quantity must be positive"));
            }
            if !seen.insert(requested.ingredient_id) {
                return Err(DomainError::validation(format!(
                    "ingredient {} appears on more than one line",
                    requested.ingredient_id
                )));
            }
            lines.push(TransferLine {
                line_no: idx as u32 + 1,
                ingredient_id: requested.ingredient_id,
                requested_qty: requested.quantity,
                shipped_qty: Decimal::ZERO,
                received_qty: Decimal::ZERO,
                shipped_unit_cost: Decimal::ZERO,
                shipped_value: Decimal::ZERO,
            });
        }

        Ok(vec![TransferEvent::Requested(TransferRequested {
            key: cmd.key,
            source_site_id: cmd.source_site_id,
            dest_site_id: cmd.dest_site_id,
            lines,
            requested_by: cmd.requested_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve(&self, cmd: &ApproveTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_key(cmd.key)?;
        self.ensure_status("approve", &[TransferStatus::Requested])?;

        Ok(vec![TransferEvent::Approved(TransferApproved {
            key: cmd.key,
            by: cmd.by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reject(&self, cmd: &RejectTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_key(cmd.key)?;
        self.ensure_status("reject", &[TransferStatus::Requested])?;
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("rejection reason is required"));
        }

        Ok(vec![TransferEvent::Rejected(TransferRejected {
            key: cmd.key,
            by: cmd.by,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_shipment(
        &self,
        cmd: &RecordShipment,
    ) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_key(cmd.key)?;
        self.ensure_can_ship()?;
        if cmd.attempt <= self.ship_attempts {
            return Err(DomainError::conflict(format!(
                "ship attempt {} was already recorded",
                cmd.attempt
            )));
        }

        // Every line ships exactly once.
        let mut expected: Vec<u32> = self.lines.iter().map(|l| l.line_no).collect();
        let mut given: Vec<u32> = cmd.lines.iter().map(|l| l.line_no).collect();
        expected.sort_unstable();
        given.sort_unstable();
        if expected != given {
            return Err(DomainError::invariant(
                "shipment must cover every transfer line once",
            ));
        }
        if cmd
            .lines
            .iter()
            .any(|l| {
                l.quantity <= Decimal::ZERO
                    || l.unit_cost < Decimal::ZERO
                    || l.value < Decimal::ZERO
            })
        {
            return Err(DomainError::validation(
                "shipped quantity must be positive, unit cost and value non-negative",
            ));
        }

        let total_value = cmd.lines.iter().map(|l| l.value).sum();
        Ok(vec![TransferEvent::Shipped(TransferShipped {
            key: cmd.key,
            attempt: cmd.attempt,
            by: cmd.by,
            tracking_number: cmd.tracking_number.clone(),
            lines: cmd.lines.clone(),
            total_value,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_ship_failure(
        &self,
        cmd: &RecordShipFailure,
    ) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_key(cmd.key)?;
        self.ensure_can_ship()?;

        Ok(vec![TransferEvent::ShipmentAttemptFailed(
            ShipmentAttemptFailed {
                key: cmd.key,
                attempt: cmd.attempt.max(self.next_ship_attempt()),
                reason: cmd.reason.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_receive_item(&self, cmd: &ReceiveItem) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_key(cmd.key)?;
        self.ensure_status("receive item", &[TransferStatus::Shipped])?;
        if cmd.received_qty < Decimal::ZERO {
            return Err(DomainError::validation("received quantity cannot be negative"));
        }
        let line = self
            .lines
            .iter()
            .find(|l| l.ingredient_id == cmd.ingredient_id)
            .ok_or_else(|| {
                DomainError::conflict(format!(
                    "ingredient {} is not on this transfer",
                    cmd.ingredient_id
                ))
            })?;

        Ok(vec![TransferEvent::ItemReceived(ItemReceived {
            key: cmd.key,
            variance: TransferVariance {
                line_no: line.line_no,
                ingredient_id: line.ingredient_id,
                shipped_qty: line.shipped_qty,
                received_qty: cmd.received_qty,
                variance: cmd.received_qty - line.shipped_qty,
                condition: cmd.condition.clone(),
                notes: cmd.notes.clone(),
            },
            by: cmd.by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_finalize(&self, cmd: &FinalizeReceipt) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_key(cmd.key)?;
        self.ensure_can_finalize()?;

        Ok(vec![TransferEvent::Received(TransferReceived {
            key: cmd.key,
            by: cmd.by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_key(cmd.key)?;
        self.ensure_can_cancel()?;

        Ok(vec![TransferEvent::Cancelled(TransferCancelled {
            key: cmd.key,
            by: cmd.by,
            reason: cmd.reason.clone(),
            stock_returned: cmd.return_stock_to_source
                && self.status == TransferStatus::Shipped,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_events::execute;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn test_key() -> TransferKey {
        TransferKey::new(TenantId::new(), TransferId::new(AggregateId::new()))
    }

    fn test_user() -> UserId {
        UserId::new()
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn requested(key: TransferKey, lines: Vec<TransferLineRequest>) -> InventoryTransfer {
        let mut transfer = InventoryTransfer::empty(key.transfer_id);
        execute(
            &mut transfer,
            &TransferCommand::Request(RequestTransfer {
                key,
                source_site_id: SiteId::new(),
                dest_site_id: SiteId::new(),
                lines,
                requested_by: test_user(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        transfer
    }

    fn one_line(ingredient_id: IngredientId, quantity: Decimal) -> Vec<TransferLineRequest> {
        vec![TransferLineRequest {
            ingredient_id,
            quantity,
        }]
    }

    fn approve(transfer: &mut InventoryTransfer, key: TransferKey) {
        execute(
            transfer,
            &TransferCommand::Approve(ApproveTransfer {
                key,
                by: test_user(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
    }

    fn ship(transfer: &mut InventoryTransfer, key: TransferKey, quantity: Decimal, unit_cost: Decimal) {
        let attempt = transfer.next_ship_attempt();
        execute(
            transfer,
            &TransferCommand::RecordShipment(RecordShipment {
                key,
                attempt,
                by: test_user(),
                tracking_number: Some("TRK-1".to_string()),
                lines: vec![ShippedLine {
                    line_no: 1,
                    quantity,
                    unit_cost,
                    value: quantity * unit_cost,
                }],
                occurred_at: test_time(),
            }),
        )
        .unwrap();
    }

    #[test]
    fn request_assigns_line_numbers() {
        let key = test_key();
        let transfer = requested(
            key,
            vec![
                TransferLineRequest {
                    ingredient_id: IngredientId::new(),
                    quantity: dec!(5),
                },
                TransferLineRequest {
                    ingredient_id: IngredientId::new(),
                    quantity: dec!(2.5),
                },
            ],
        );

        assert_eq!(transfer.status(), TransferStatus::Requested);
        let numbers: Vec<u32> = transfer.lines().iter().map(|l| l.line_no).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(transfer.lines()[1].requested_qty, dec!(2.5));
    }

    #[test]
    fn request_validation() {
        let key = test_key();
        let empty = InventoryTransfer::empty(key.transfer_id);
        let site = SiteId::new();
        let flour = IngredientId::new();

        let request = |source: SiteId, dest: SiteId, lines: Vec<TransferLineRequest>| {
            TransferCommand::Request(RequestTransfer {
                key,
                source_site_id: source,
                dest_site_id: dest,
                lines,
                requested_by: test_user(),
                occurred_at: test_time(),
            })
        };

        let cases = vec![
            request(site, site, one_line(flour, dec!(1))),
            request(site, SiteId::new(), vec![]),
            request(site, SiteId::new(), one_line(flour, dec!(0))),
            request(
                site,
                SiteId::new(),
                vec![
                    TransferLineRequest {
                        ingredient_id: flour,
                        quantity: dec!(1),
                    },
                    TransferLineRequest {
                        ingredient_id: flour,
                        quantity: dec!(2),
                    },
                ],
            ),
        ];
        for cmd in cases {
            match empty.handle(&cmd) {
                Err(DomainError::Validation(_)) => {}
                other => panic!("expected validation error, got {other:?}"),
            }
        }
    }

    #[test]
    fn approve_and_reject_only_from_requested() {
        let key = test_key();
        let mut transfer = requested(key, one_line(IngredientId::new(), dec!(1)));
        approve(&mut transfer, key);
        assert_eq!(transfer.status(), TransferStatus::Approved);

        let err = transfer
            .handle(&TransferCommand::Reject(RejectTransfer {
                key,
                by: test_user(),
                reason: "late".to_string(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "conflict: cannot reject while in state Approved"
        );

        let err = transfer
            .handle(&TransferCommand::Approve(ApproveTransfer {
                key,
                by: test_user(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn rejected_transfer_is_terminal() {
        let key = test_key();
        let mut transfer = requested(key, one_line(IngredientId::new(), dec!(1)));
        execute(
            &mut transfer,
            &TransferCommand::Reject(RejectTransfer {
                key,
                by: test_user(),
                reason: "not needed".to_string(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert!(transfer.status().is_terminal());
        assert!(transfer.ensure_can_ship().is_err());
        assert!(transfer.ensure_can_cancel().is_err());
        assert_eq!(
            transfer.snapshot().unwrap().rejection_reason.as_deref(),
            Some("not needed")
        );
    }

    #[test]
    fn shipping_requires_approval() {
        let key = test_key();
        let transfer = requested(key, one_line(IngredientId::new(), dec!(1)));
        let err = transfer.ensure_can_ship().unwrap_err();
        assert_eq!(
            err,
            DomainError::state_conflict("ship", TransferStatus::Requested)
        );
    }

    #[test]
    fn shipment_records_value_and_costs() {
        let key = test_key();
        let mut transfer = requested(key, one_line(IngredientId::new(), dec!(25)));
        approve(&mut transfer, key);
        ship(&mut transfer, key, dec!(25), dec!(5));

        assert_eq!(transfer.status(), TransferStatus::Shipped);
        assert_eq!(transfer.total_shipped_value(), dec!(125));
        assert_eq!(transfer.lines()[0].shipped_qty, dec!(25));
        assert_eq!(transfer.lines()[0].shipped_unit_cost, dec!(5));
        assert_eq!(transfer.ship_attempts(), 1);
    }

    #[test]
    fn shipped_value_is_the_reported_cost_not_a_rederived_product() {
        let key = test_key();
        let mut transfer = requested(key, one_line(IngredientId::new(), dec!(3)));
        approve(&mut transfer, key);
        let unit_cost = dec!(5) / dec!(3);
        execute(
            &mut transfer,
            &TransferCommand::RecordShipment(RecordShipment {
                key,
                attempt: 1,
                by: test_user(),
                tracking_number: None,
                lines: vec![ShippedLine {
                    line_no: 1,
                    quantity: dec!(3),
                    unit_cost,
                    value: dec!(5),
                }],
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_ne!(dec!(3) * unit_cost, dec!(5));
        assert_eq!(transfer.total_shipped_value(), dec!(5));
        assert_eq!(transfer.lines()[0].shipped_value, dec!(5));
    }

    #[test]
    fn shipment_must_cover_every_line() {
        let key = test_key();
        let mut transfer = requested(
            key,
            vec![
                TransferLineRequest {
                    ingredient_id: IngredientId::new(),
                    quantity: dec!(1),
                },
                TransferLineRequest {
                    ingredient_id: IngredientId::new(),
                    quantity: dec!(1),
                },
            ],
        );
        approve(&mut transfer, key);

        let err = transfer
            .handle(&TransferCommand::RecordShipment(RecordShipment {
                key,
                attempt: 1,
                by: test_user(),
                tracking_number: None,
                lines: vec![ShippedLine {
                    line_no: 1,
                    quantity: dec!(1),
                    unit_cost: dec!(1),
                    value: dec!(1),
                }],
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn failed_attempts_advance_the_counter() {
        let key = test_key();
        let mut transfer = requested(key, one_line(IngredientId::new(), dec!(1)));
        approve(&mut transfer, key);

        execute(
            &mut transfer,
            &TransferCommand::RecordShipFailure(RecordShipFailure {
                key,
                attempt: 1,
                reason: "source ledger unavailable".to_string(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(transfer.status(), TransferStatus::Approved);
        assert_eq!(transfer.next_ship_attempt(), 2);
        assert_eq!(transfer.total_shipped_value(), dec!(0));
        assert_eq!(transfer.lines()[0].shipped_qty, dec!(0));
    }

    #[test]
    fn receive_item_records_variance() {
        let key = test_key();
        let flour = IngredientId::new();
        let mut transfer = requested(key, one_line(flour, dec!(25)));
        approve(&mut transfer, key);
        ship(&mut transfer, key, dec!(25), dec!(5));

        execute(
            &mut transfer,
            &TransferCommand::ReceiveItem(ReceiveItem {
                key,
                ingredient_id: flour,
                received_qty: dec!(23),
                by: test_user(),
                condition: Some("2 bags torn".to_string()),
                notes: None,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(transfer.variances().len(), 1);
        assert_eq!(transfer.variances()[0].variance, dec!(-2));
        assert_eq!(transfer.lines()[0].received_qty, dec!(23));
        assert_eq!(transfer.status(), TransferStatus::Shipped);
    }

    #[test]
    fn receive_item_for_unknown_ingredient_is_a_conflict() {
        let key = test_key();
        let mut transfer = requested(key, one_line(IngredientId::new(), dec!(1)));
        approve(&mut transfer, key);
        ship(&mut transfer, key, dec!(1), dec!(1));

        let err = transfer
            .handle(&TransferCommand::ReceiveItem(ReceiveItem {
                key,
                ingredient_id: IngredientId::new(),
                received_qty: dec!(1),
                by: test_user(),
                condition: None,
                notes: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn receive_item_before_shipment_is_a_conflict() {
        let key = test_key();
        let flour = IngredientId::new();
        let mut transfer = requested(key, one_line(flour, dec!(1)));
        approve(&mut transfer, key);

        let err = transfer
            .handle(&TransferCommand::ReceiveItem(ReceiveItem {
                key,
                ingredient_id: flour,
                received_qty: dec!(1),
                by: test_user(),
                condition: None,
                notes: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::state_conflict("receive item", TransferStatus::Approved)
        );
    }

    #[test]
    fn cancel_flags_returned_stock_only_after_shipment() {
        let cancel = |key: TransferKey| {
            TransferCommand::Cancel(CancelTransfer {
                key,
                by: test_user(),
                reason: "site closed".to_string(),
                return_stock_to_source: true,
                occurred_at: test_time(),
            })
        };

        let key = test_key();
        let mut approved = requested(key, one_line(IngredientId::new(), dec!(1)));
        approve(&mut approved, key);
        execute(&mut approved, &cancel(key)).unwrap();
        assert_eq!(approved.status(), TransferStatus::Cancelled);
        assert!(!approved.stock_returned_to_source());

        let key = test_key();
        let mut shipped = requested(key, one_line(IngredientId::new(), dec!(1)));
        approve(&mut shipped, key);
        ship(&mut shipped, key, dec!(1), dec!(2));
        execute(&mut shipped, &cancel(key)).unwrap();
        assert!(shipped.stock_returned_to_source());

        let key = test_key();
        let pending = requested(key, one_line(IngredientId::new(), dec!(1)));
        assert!(matches!(
            pending.handle(&cancel(key)),
            Err(DomainError::Conflict(_))
        ));
    }

    #[test]
    fn other_tenant_is_rejected() {
        let key = test_key();
        let transfer = requested(key, one_line(IngredientId::new(), dec!(1)));
        let foreign = TransferKey::new(TenantId::new(), key.transfer_id);

        let err = transfer
            .handle(&TransferCommand::Approve(ApproveTransfer {
                key: foreign,
                by: test_user(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::invariant("tenant mismatch"));
    }

    #[test]
    fn operation_keys_name_line_and_step() {
        let key = test_key();
        assert_eq!(
            key.operation_key(2, "ship:1"),
            format!("transfer:{}:line:2:ship:1", key.transfer_id)
        );
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Approve,
        Reject,
        Ship,
        Finalize,
        Cancel,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Approve),
            Just(Step::Reject),
            Just(Step::Ship),
            Just(Step::Finalize),
            Just(Step::Cancel),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: once a transfer reaches a terminal state, no command
        /// changes it again.
        #[test]
        fn terminal_states_are_sticky(steps in prop::collection::vec(step(), 1..12)) {
            let key = test_key();
            let mut transfer = requested(key, one_line(IngredientId::new(), dec!(3)));
            let user = test_user();
            let now = test_time();

            for s in steps {
                let before = transfer.status();
                let cmd = match s {
                    Step::Approve => TransferCommand::Approve(ApproveTransfer { key, by: user, occurred_at: now }),
                    Step::Reject => TransferCommand::Reject(RejectTransfer { key, by: user, reason: "no".to_string(), occurred_at: now }),
                    Step::Ship => TransferCommand::RecordShipment(RecordShipment {
                        key,
                        attempt: transfer.next_ship_attempt(),
                        by: user,
                        tracking_number: None,
                        lines: vec![ShippedLine { line_no: 1, quantity: dec!(3), unit_cost: dec!(1), value: dec!(3) }],
                        occurred_at: now,
                    }),
                    Step::Finalize => TransferCommand::FinalizeReceipt(FinalizeReceipt { key, by: user, occurred_at: now }),
                    Step::Cancel => TransferCommand::Cancel(CancelTransfer { key, by: user, reason: "x".to_string(), return_stock_to_source: true, occurred_at: now }),
                };
                let result = execute(&mut transfer, &cmd);
                if before.is_terminal() {
                    prop_assert!(result.is_err());
                    prop_assert_eq!(transfer.status(), before);
                }
            }
        }
    }
}
