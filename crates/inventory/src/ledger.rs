use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use larder_core::{Aggregate, AggregateId, AggregateRoot, DomainError, SiteId};
use larder_costing::{
    BatchDraw, BatchId, CostingMethod, CostingPolicy, CostingResult, FifoCosting, StockBatch,
};
use larder_events::Event;

use crate::key::{LedgerKey, StockLedgerId};
use crate::level::{LevelInfo, StockLevel};

/// Aggregate type name used for event streams and actor addressing.
pub const AGGREGATE_TYPE: &str = "inventory.ledger";

/// How many operation keys a ledger remembers. Older keys are forgotten in
/// arrival order, so a retry must arrive within this many keyed movements.
pub const RETAINED_OPERATION_KEYS: usize = 10_000;

/// Aggregate root: StockLedger (one ingredient at one site).
///
/// Derived fields are recomputed once per applied event and stored, so reads
/// never walk the batch list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLedger {
    id: StockLedgerId,
    key: Option<LedgerKey>,
    name: String,
    sku: Option<String>,
    unit: String,
    category: Option<String>,
    reorder_point: Decimal,
    par_level: Decimal,
    batches: Vec<StockBatch>,
    unbatched_deficit: Decimal,

    quantity_on_hand: Decimal,
    weighted_average_cost: Decimal,
    level: StockLevel,

    /// Outcome of the most recent keyed commands.
    operations: HashMap<String, LedgerOutcome>,
    /// Keys of `operations`, oldest first.
    operation_log: VecDeque<String>,
    version: u64,
    created: bool,
}

/// Full snapshot of a ledger (GetState).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryState {
    pub key: LedgerKey,
    pub name: String,
    pub sku: Option<String>,
    pub unit: String,
    pub category: Option<String>,
    pub reorder_point: Decimal,
    pub par_level: Decimal,
    pub batches: Vec<StockBatch>,
    pub unbatched_deficit: Decimal,
    pub quantity_on_hand: Decimal,
    pub quantity_available: Decimal,
    pub weighted_average_cost: Decimal,
    pub level: StockLevel,
    pub version: u64,
}

impl StockLedger {
    /// Create an empty, not-yet-initialized aggregate instance for rehydration.
    pub fn empty(id: StockLedgerId) -> Self {
        Self {
            id,
            key: None,
            name: String::new(),
            sku: None,
            unit: String::new(),
            category: None,
            reorder_point: Decimal::ZERO,
            par_level: Decimal::ZERO,
            batches: Vec::new(),
            unbatched_deficit: Decimal::ZERO,
            quantity_on_hand: Decimal::ZERO,
            weighted_average_cost: Decimal::ZERO,
            level: StockLevel::OutOfStock,
            operations: HashMap::new(),
            operation_log: VecDeque::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> StockLedgerId {
        self.id
    }

    pub fn key(&self) -> Option<LedgerKey> {
        self.key
    }

    pub fn is_initialized(&self) -> bool {
        self.created
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn quantity_on_hand(&self) -> Decimal {
        self.quantity_on_hand
    }

    /// Reservations are not tracked, so everything on hand is available.
    pub fn quantity_available(&self) -> Decimal {
        self.quantity_on_hand
    }

    pub fn unbatched_deficit(&self) -> Decimal {
        self.unbatched_deficit
    }

    pub fn weighted_average_cost(&self) -> Decimal {
        self.weighted_average_cost
    }

    pub fn stock_level(&self) -> StockLevel {
        self.level
    }

    /// Every batch ever received, in reception order (exhausted ones included).
    pub fn batches(&self) -> &[StockBatch] {
        &self.batches
    }

    pub fn active_batches(&self) -> Vec<StockBatch> {
        self.batches
            .iter()
            .filter(|b| b.is_active())
            .cloned()
            .collect()
    }

    pub fn level_info(&self) -> LevelInfo {
        LevelInfo {
            quantity_on_hand: self.quantity_on_hand,
            quantity_available: self.quantity_available(),
            unbatched_deficit: self.unbatched_deficit,
            reorder_point: self.reorder_point,
            par_level: self.par_level,
            weighted_average_cost: self.weighted_average_cost,
            level: self.level,
        }
    }

    /// `None` until the ledger is initialized.
    pub fn snapshot(&self) -> Option<InventoryState> {
        let key = self.key?;
        Some(InventoryState {
            key,
            name: self.name.clone(),
            sku: self.sku.clone(),
            unit: self.unit.clone(),
            category: self.category.clone(),
            reorder_point: self.reorder_point,
            par_level: self.par_level,
            batches: self.batches.clone(),
            unbatched_deficit: self.unbatched_deficit,
            quantity_on_hand: self.quantity_on_hand,
            quantity_available: self.quantity_available(),
            weighted_average_cost: self.weighted_average_cost,
            level: self.level,
            version: self.version,
        })
    }

    /// Value `quantity` units of current stock with any costing policy,
    /// without touching the ledger.
    pub fn value_stock(
        &self,
        policy: &dyn CostingPolicy,
        quantity: Decimal,
        as_of: DateTime<Utc>,
    ) -> CostingResult {
        policy.calculate_cost(&self.batches, quantity, &self.unit, as_of)
    }

    /// Outcome previously recorded for an operation key.
    pub fn recorded_outcome(&self, operation_key: &str) -> Option<&LedgerOutcome> {
        self.operations.get(operation_key)
    }

    /// Outcome of a freshly applied event, read from the current state.
    ///
    /// Call after the event was applied; `StockLevelChanged` and
    /// initialization have no outcome.
    pub fn outcome_of(&self, event: &InventoryEvent) -> Option<LedgerOutcome> {
        match event {
            InventoryEvent::StockReceived(e) => Some(LedgerOutcome::Received(ReceiptOutcome {
                quantity_on_hand: self.quantity_on_hand,
                absorbed_deficit: e.absorbed_deficit,
                created_batch_id: e.created_batch.as_ref().map(StockBatch::id),
            })),
            InventoryEvent::StockConsumed(e) => {
                Some(LedgerOutcome::Consumed(ConsumptionOutcome {
                    quantity_on_hand: self.quantity_on_hand,
                    deficit_added: e.deficit_added,
                    draws: e.draws.clone(),
                    costing: CostingResult::layered(
                        CostingMethod::Fifo,
                        e.draws.iter().map(Into::into).collect(),
                        &self.unit,
                        e.occurred_at,
                    ),
                }))
            }
            InventoryEvent::ConsumptionReversed(e) => {
                Some(LedgerOutcome::Reversal(ReversalOutcome {
                    quantity_on_hand: self.quantity_on_hand,
                    quantity_restored: e.quantity,
                    value_restored: e.value(),
                }))
            }
            InventoryEvent::LedgerInitialized(_) | InventoryEvent::StockLevelChanged(_) => None,
        }
    }

    fn record_operation(&mut self, operation_key: String, outcome: LedgerOutcome) {
        if self
            .operations
            .insert(operation_key.clone(), outcome)
            .is_none()
        {
            self.operation_log.push_back(operation_key);
        }
        while self.operation_log.len() > RETAINED_OPERATION_KEYS {
            if let Some(oldest) = self.operation_log.pop_front() {
                self.operations.remove(&oldest);
            }
        }
    }

    /// Price for stock that shows up without an invoice: the current
    /// average, or the latest reception price when no cost basis is left.
    fn found_stock_unit_cost(&self) -> Decimal {
        if self.weighted_average_cost > Decimal::ZERO {
            self.weighted_average_cost
        } else {
            self.batches
                .iter()
                .max_by_key(|b| b.received_at())
                .map(StockBatch::unit_cost)
                .unwrap_or(Decimal::ZERO)
        }
    }

    fn recompute(&mut self) {
        let (active_qty, active_value) = self
            .batches
            .iter()
            .filter(|b| b.is_active())
            .fold((Decimal::ZERO, Decimal::ZERO), |(q, v), b| {
                (q + b.quantity(), v + b.quantity() * b.unit_cost())
            });

        self.quantity_on_hand = active_qty - self.unbatched_deficit;
        // Cost basis is dropped while stock is at or below zero.
        self.weighted_average_cost = if self.quantity_on_hand > Decimal::ZERO {
            active_value / self.quantity_on_hand
        } else {
            Decimal::ZERO
        };
        self.level = StockLevel::classify(self.quantity_available(), self.reorder_point);
    }
}

impl AggregateRoot for StockLedger {
    type Id = StockLedgerId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Where received stock came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReceiptSource {
    Purchase,
    Transfer {
        source_site_id: SiteId,
        transfer_id: AggregateId,
    },
    Adjustment {
        reason: String,
    },
}

/// Result of a receive. `created_batch_id` is `None` when the whole quantity
/// went into an outstanding deficit and no batch row was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptOutcome {
    pub quantity_on_hand: Decimal,
    pub absorbed_deficit: Decimal,
    pub created_batch_id: Option<BatchId>,
}

/// Result of a withdrawal. `costing` covers only the batch-backed portion;
/// the deficit added carries no cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionOutcome {
    pub quantity_on_hand: Decimal,
    pub deficit_added: Decimal,
    /// Batch-level depletion, kept so the withdrawal can be reversed exactly.
    pub draws: Vec<BatchDraw>,
    pub costing: CostingResult,
}

/// Result of reversing a withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversalOutcome {
    pub quantity_on_hand: Decimal,
    pub quantity_restored: Decimal,
    pub value_restored: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerOutcome {
    Received(ReceiptOutcome),
    Consumed(ConsumptionOutcome),
    Reversal(ReversalOutcome),
    /// The key was reversed. A withdrawal carrying it is refused.
    Voided,
}

/// Command: InitializeLedger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeLedger {
    pub key: LedgerKey,
    pub name: String,
    pub sku: Option<String>,
    pub unit: String,
    pub category: Option<String>,
    pub reorder_point: Decimal,
    pub par_level: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReceiveBatch (purchase orders and deliveries).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveBatch {
    pub key: LedgerKey,
    pub operation_key: Option<String>,
    pub batch_number: String,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConsumeStock (always depletes FIFO).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeStock {
    pub key: LedgerKey,
    pub operation_key: Option<String>,
    pub quantity: Decimal,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReceiveTransfer (stock arriving from another site).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveTransfer {
    pub key: LedgerKey,
    pub operation_key: Option<String>,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub source_site_id: SiteId,
    pub transfer_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AdjustStock (physical count correction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustStock {
    pub key: LedgerKey,
    pub operation_key: Option<String>,
    pub delta: Decimal,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReverseConsumption (undo a keyed withdrawal).
///
/// Safe whether or not the original withdrawal was applied: an applied one
/// is put back into the batches it drew from; an unapplied one is voided so
/// it can no longer land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseConsumption {
    pub key: LedgerKey,
    pub operation_key: String,
    pub original_operation_key: String,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryCommand {
    InitializeLedger(InitializeLedger),
    ReceiveBatch(ReceiveBatch),
    ConsumeStock(ConsumeStock),
    ReceiveTransfer(ReceiveTransfer),
    AdjustStock(AdjustStock),
    ReverseConsumption(ReverseConsumption),
}

impl InventoryCommand {
    pub fn key(&self) -> LedgerKey {
        match self {
            InventoryCommand::InitializeLedger(c) => c.key,
            InventoryCommand::ReceiveBatch(c) => c.key,
            InventoryCommand::ConsumeStock(c) => c.key,
            InventoryCommand::ReceiveTransfer(c) => c.key,
            InventoryCommand::AdjustStock(c) => c.key,
            InventoryCommand::ReverseConsumption(c) => c.key,
        }
    }

    pub fn operation_key(&self) -> Option<&str> {
        match self {
            InventoryCommand::InitializeLedger(_) => None,
            InventoryCommand::ReceiveBatch(c) => c.operation_key.as_deref(),
            InventoryCommand::ConsumeStock(c) => c.operation_key.as_deref(),
            InventoryCommand::ReceiveTransfer(c) => c.operation_key.as_deref(),
            InventoryCommand::AdjustStock(c) => c.operation_key.as_deref(),
            InventoryCommand::ReverseConsumption(c) => Some(&c.operation_key),
        }
    }
}

/// Event: LedgerInitialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerInitialized {
    pub key: LedgerKey,
    pub name: String,
    pub sku: Option<String>,
    pub unit: String,
    pub category: Option<String>,
    pub reorder_point: Decimal,
    pub par_level: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReceived.
///
/// `absorbed_deficit` is the part of `quantity` that paid down the unbatched
/// deficit; the remainder (if any) is `created_batch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReceived {
    pub key: LedgerKey,
    pub operation_key: Option<String>,
    pub source: ReceiptSource,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub absorbed_deficit: Decimal,
    pub created_batch: Option<StockBatch>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockConsumed.
///
/// `draws` lists the batch-backed portion in FIFO order; `deficit_added` is the
/// shortfall no batch could supply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockConsumed {
    pub key: LedgerKey,
    pub operation_key: Option<String>,
    pub quantity: Decimal,
    pub reason: String,
    pub draws: Vec<BatchDraw>,
    pub deficit_added: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ConsumptionReversed.
///
/// `restored` goes back into the batches it was drawn from. The withdrawal's
/// deficit is paid back first; any part of it a later receipt already
/// absorbed comes back as `rebatched`. All empty when the original never
/// landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionReversed {
    pub key: LedgerKey,
    pub operation_key: String,
    pub original_operation_key: String,
    pub reason: String,
    pub quantity: Decimal,
    pub restored: Vec<BatchDraw>,
    pub deficit_removed: Decimal,
    pub rebatched: Option<StockBatch>,
    pub occurred_at: DateTime<Utc>,
}

impl ConsumptionReversed {
    pub fn value(&self) -> Decimal {
        let restored: Decimal = self.restored.iter().map(|d| d.quantity * d.unit_cost).sum();
        restored + self.rebatched.as_ref().map_or(Decimal::ZERO, StockBatch::total_cost)
    }
}

/// Event: StockLevelChanged (emitted alongside the movement that caused it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevelChanged {
    pub key: LedgerKey,
    pub from: StockLevel,
    pub to: StockLevel,
    pub quantity_on_hand: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    LedgerInitialized(LedgerInitialized),
    StockReceived(StockReceived),
    StockConsumed(StockConsumed),
    ConsumptionReversed(ConsumptionReversed),
    StockLevelChanged(StockLevelChanged),
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::LedgerInitialized(_) => "inventory.ledger.initialized",
            InventoryEvent::StockReceived(_) => "inventory.ledger.stock_received",
            InventoryEvent::StockConsumed(_) => "inventory.ledger.stock_consumed",
            InventoryEvent::ConsumptionReversed(_) => "inventory.ledger.consumption_reversed",
            InventoryEvent::StockLevelChanged(_) => "inventory.ledger.level_changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryEvent::LedgerInitialized(e) => e.occurred_at,
            InventoryEvent::StockReceived(e) => e.occurred_at,
            InventoryEvent::StockConsumed(e) => e.occurred_at,
            InventoryEvent::ConsumptionReversed(e) => e.occurred_at,
            InventoryEvent::StockLevelChanged(e) => e.occurred_at,
        }
    }
}

impl Aggregate for StockLedger {
    type Command = InventoryCommand;
    type Event = InventoryEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InventoryEvent::LedgerInitialized(e) => {
                self.key = Some(e.key);
                self.name = e.name.clone();
                self.sku = e.sku.clone();
                self.unit = e.unit.clone();
                self.category = e.category.clone();
                self.reorder_point = e.reorder_point;
                self.par_level = e.par_level;
                self.batches.clear();
                self.unbatched_deficit = Decimal::ZERO;
                self.created = true;
            }
            InventoryEvent::StockReceived(e) => {
                self.unbatched_deficit =
                    (self.unbatched_deficit - e.absorbed_deficit).max(Decimal::ZERO);
                if let Some(batch) = &e.created_batch {
                    self.batches.push(batch.clone());
                }
            }
            InventoryEvent::StockConsumed(e) => {
                for draw in &e.draws {
                    if let Some(batch) = self.batches.iter_mut().find(|b| b.id() == draw.batch_id) {
                        batch.draw(draw.quantity);
                    }
                }
                self.unbatched_deficit += e.deficit_added;
            }
            InventoryEvent::ConsumptionReversed(e) => {
                for draw in &e.restored {
                    if let Some(batch) = self.batches.iter_mut().find(|b| b.id() == draw.batch_id) {
                        batch.restore(draw.quantity);
                    }
                }
                self.unbatched_deficit =
                    (self.unbatched_deficit - e.deficit_removed).max(Decimal::ZERO);
                if let Some(batch) = &e.rebatched {
                    self.batches.push(batch.clone());
                }
            }
            InventoryEvent::StockLevelChanged(_) => {}
        }

        self.recompute();

        let operation_key = match event {
            InventoryEvent::StockReceived(e) => e.operation_key.clone(),
            InventoryEvent::StockConsumed(e) => e.operation_key.clone(),
            InventoryEvent::ConsumptionReversed(e) => Some(e.operation_key.clone()),
            _ => None,
        };
        if let (Some(op), Some(outcome)) = (operation_key, self.outcome_of(event)) {
            self.record_operation(op, outcome);
        }
        if let InventoryEvent::ConsumptionReversed(e) = event {
            self.record_operation(e.original_operation_key.clone(), LedgerOutcome::Voided);
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if let Some(op) = command.operation_key() {
            match self.operations.get(op) {
                Some(LedgerOutcome::Voided) => {
                    return Err(DomainError::conflict(format!(
                        "operation {op} was reversed"
                    )));
                }
                Some(_) => return Ok(vec![]),
                None => {}
            }
        }

        match command {
            InventoryCommand::InitializeLedger(cmd) => self.handle_initialize(cmd),
            InventoryCommand::ReceiveBatch(cmd) => self.handle_receive_batch(cmd),
            InventoryCommand::ConsumeStock(cmd) => self.handle_consume(cmd),
            InventoryCommand::ReceiveTransfer(cmd) => self.handle_receive_transfer(cmd),
            InventoryCommand::AdjustStock(cmd) => self.handle_adjust(cmd),
            InventoryCommand::ReverseConsumption(cmd) => self.handle_reverse(cmd),
        }
    }
}

impl StockLedger {
    fn ensure_key(&self, key: LedgerKey) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        match self.key {
            Some(k) if k.tenant_id != key.tenant_id => {
                Err(DomainError::invariant("tenant mismatch"))
            }
            Some(k) if k != key => Err(DomainError::invariant("ledger key mismatch")),
            _ => Ok(()),
        }
    }

    fn ensure_positive(quantity: Decimal) -> Result<(), DomainError> {
        if quantity <= Decimal::ZERO {
            return Err(DomainError::validation("quantity must be positive"));
        }
        Ok(())
    }

    fn ensure_unit_cost(unit_cost: Decimal) -> Result<(), DomainError> {
        if unit_cost < Decimal::ZERO {
            return Err(DomainError::validation("unit cost cannot be negative"));
        }
        Ok(())
    }

    /// Appends a `StockLevelChanged` when moving stock by `delta` crosses a
    /// level boundary.
    fn with_level_change(
        &self,
        mut events: Vec<InventoryEvent>,
        key: LedgerKey,
        delta: Decimal,
        occurred_at: DateTime<Utc>,
    ) -> Vec<InventoryEvent> {
        let after = self.quantity_on_hand + delta;
        let to = StockLevel::classify(after, self.reorder_point);
        if to != self.level {
            events.push(InventoryEvent::StockLevelChanged(StockLevelChanged {
                key,
                from: self.level,
                to,
                quantity_on_hand: after,
                occurred_at,
            }));
        }
        events
    }

    fn handle_initialize(&self, cmd: &InitializeLedger) -> Result<Vec<InventoryEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("ledger already initialized"));
        }
        if cmd.key.ledger_id() != self.id {
            return Err(DomainError::invariant("ledger key does not address this ledger"));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if cmd.unit.trim().is_empty() {
            return Err(DomainError::validation("unit cannot be empty"));
        }
        if cmd.reorder_point < Decimal::ZERO || cmd.par_level < Decimal::ZERO {
            return Err(DomainError::validation(
                "reorder point and par level cannot be negative",
            ));
        }

        Ok(vec![InventoryEvent::LedgerInitialized(LedgerInitialized {
            key: cmd.key,
            name: cmd.name.clone(),
            sku: cmd.sku.clone(),
            unit: cmd.unit.clone(),
            category: cmd.category.clone(),
            reorder_point: cmd.reorder_point,
            par_level: cmd.par_level,
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Deficit-first absorption shared by every kind of receipt.
    #[allow(clippy::too_many_arguments)]
    fn receive(
        &self,
        key: LedgerKey,
        operation_key: Option<String>,
        source: ReceiptSource,
        batch_number: String,
        quantity: Decimal,
        unit_cost: Decimal,
        occurred_at: DateTime<Utc>,
    ) -> Vec<InventoryEvent> {
        let absorbed = quantity.min(self.unbatched_deficit);
        let remaining = quantity - absorbed;
        let created_batch = (remaining > Decimal::ZERO).then(|| {
            StockBatch::received(BatchId::new(), batch_number, occurred_at, remaining, unit_cost)
        });

        let received = InventoryEvent::StockReceived(StockReceived {
            key,
            operation_key,
            source,
            quantity,
            unit_cost,
            absorbed_deficit: absorbed,
            created_batch,
            occurred_at,
        });
        self.with_level_change(vec![received], key, quantity, occurred_at)
    }

    /// FIFO physical depletion; the shortfall becomes deficit.
    fn consume(
        &self,
        key: LedgerKey,
        operation_key: Option<String>,
        quantity: Decimal,
        reason: String,
        occurred_at: DateTime<Utc>,
    ) -> Vec<InventoryEvent> {
        let draws = FifoCosting::draw_plan(&self.batches, quantity);
        let served: Decimal = draws.iter().map(|d| d.quantity).sum();

        let consumed = InventoryEvent::StockConsumed(StockConsumed {
            key,
            operation_key,
            quantity,
            reason,
            draws,
            deficit_added: quantity - served,
            occurred_at,
        });
        self.with_level_change(vec![consumed], key, -quantity, occurred_at)
    }

    fn handle_receive_batch(&self, cmd: &ReceiveBatch) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_key(cmd.key)?;
        Self::ensure_positive(cmd.quantity)?;
        Self::ensure_unit_cost(cmd.unit_cost)?;
        if cmd.batch_number.trim().is_empty() {
            return Err(DomainError::validation("batch number cannot be empty"));
        }

        Ok(self.receive(
            cmd.key,
            cmd.operation_key.clone(),
            ReceiptSource::Purchase,
            cmd.batch_number.clone(),
            cmd.quantity,
            cmd.unit_cost,
            cmd.occurred_at,
        ))
    }

    fn handle_consume(&self, cmd: &ConsumeStock) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_key(cmd.key)?;
        Self::ensure_positive(cmd.quantity)?;

        Ok(self.consume(
            cmd.key,
            cmd.operation_key.clone(),
            cmd.quantity,
            cmd.reason.clone(),
            cmd.occurred_at,
        ))
    }

    fn handle_receive_transfer(
        &self,
        cmd: &ReceiveTransfer,
    ) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_key(cmd.key)?;
        Self::ensure_positive(cmd.quantity)?;
        Self::ensure_unit_cost(cmd.unit_cost)?;

        Ok(self.receive(
            cmd.key,
            cmd.operation_key.clone(),
            ReceiptSource::Transfer {
                source_site_id: cmd.source_site_id,
                transfer_id: cmd.transfer_id,
            },
            format!("TRF-{}", cmd.transfer_id),
            cmd.quantity,
            cmd.unit_cost,
            cmd.occurred_at,
        ))
    }

    fn handle_adjust(&self, cmd: &AdjustStock) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_key(cmd.key)?;
        if cmd.delta.is_zero() {
            return Err(DomainError::validation("delta cannot be zero"));
        }
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("adjustment reason is required"));
        }

        if cmd.delta > Decimal::ZERO {
            let unit_cost = self.found_stock_unit_cost();
            Ok(self.receive(
                cmd.key,
                cmd.operation_key.clone(),
                ReceiptSource::Adjustment {
                    reason: cmd.reason.clone(),
                },
                format!("ADJ-{:04}", self.version + 1),
                cmd.delta,
                unit_cost,
                cmd.occurred_at,
            ))
        } else {
            Ok(self.consume(
                cmd.key,
                cmd.operation_key.clone(),
                -cmd.delta,
                format!("adjustment: {}", cmd.reason),
                cmd.occurred_at,
            ))
        }
    }

    fn handle_reverse(
        &self,
        cmd: &ReverseConsumption,
    ) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_key(cmd.key)?;
        if cmd.operation_key == cmd.original_operation_key {
            return Err(DomainError::validation(
                "a reversal needs its own operation key",
            ));
        }

        let (restored, deficit_added) = match self.operations.get(&cmd.original_operation_key) {
            Some(LedgerOutcome::Consumed(original)) => {
                (original.draws.clone(), original.deficit_added)
            }
            Some(LedgerOutcome::Voided) | None => (Vec::new(), Decimal::ZERO),
            Some(_) => {
                return Err(DomainError::validation(format!(
                    "operation {} is not a withdrawal",
                    cmd.original_operation_key
                )));
            }
        };

        let deficit_removed = deficit_added.min(self.unbatched_deficit);
        let absorbed_since = deficit_added - deficit_removed;
        let rebatched = (absorbed_since > Decimal::ZERO).then(|| {
            StockBatch::received(
                BatchId::new(),
                format!("REV-{:04}", self.version + 1),
                cmd.occurred_at,
                absorbed_since,
                self.found_stock_unit_cost(),
            )
        });
        let quantity = restored.iter().map(|d| d.quantity).sum::<Decimal>() + deficit_added;

        let reversed = InventoryEvent::ConsumptionReversed(ConsumptionReversed {
            key: cmd.key,
            operation_key: cmd.operation_key.clone(),
            original_operation_key: cmd.original_operation_key.clone(),
            reason: cmd.reason.clone(),
            quantity,
            restored,
            deficit_removed,
            rebatched,
            occurred_at: cmd.occurred_at,
        });
        Ok(self.with_level_change(vec![reversed], cmd.key, quantity, cmd.occurred_at))
    }
}
