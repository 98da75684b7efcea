//! Transfer coordinator: the transfer actor and the cross-ledger stock
//! movements it performs inside its own turn.
//!
//! Every ledger call carries an operation key of the form
//! `transfer:<id>:line:<n>:<step>`, so a retried call (after a timeout, or a
//! whole retried Ship/Finalize/Cancel) never moves stock twice.
//!
//! | step                    | ledger command                           |
//! |-------------------------|------------------------------------------|
//! | `ship:<attempt>`        | consume from source (FIFO)               |
//! | `ship:<attempt>:revert` | reverse that consume, applied or not     |
//! | `receive`               | credit destination                       |
//! | `return`                | re-credit source on cancel               |
//!
//! A consume that timed out may still land later. Its reversal is keyed on
//! the consume's own operation key, so the ledger either puts the stock back
//! or refuses the consume when it finally arrives. Reversals of every earlier
//! attempt are replayed before a new attempt starts and before an approved
//! transfer is cancelled.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use larder_core::{AggregateId, DomainError, SiteId, TenantId, UserId};
use larder_inventory::{ConsumeStock, LedgerKey, ReceiveTransfer, ReverseConsumption};
use larder_transfers::{
    CancelTransfer, FinalizeReceipt, InventoryTransfer, RecordShipFailure, RecordShipment,
    ShippedLine, TransferCommand, TransferKey, TransferLine, TransferState, TransferStatus,
};

use crate::config::{RetryConfig, RuntimeConfig};
use crate::error::ActorError;
use crate::event_store::EventStore;
use crate::ledger::LedgerClient;
use crate::runtime::{ActorRuntime, Entity, EntityCell};

pub use larder_transfers::{
    ApproveTransfer, ReceiveItem, RejectTransfer, RequestTransfer, TransferLineRequest,
};

/// Request: ship an approved transfer out of the source site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipTransfer {
    pub key: TransferKey,
    pub by: UserId,
    pub tracking_number: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum TransferRequest {
    Request(RequestTransfer),
    Approve(ApproveTransfer),
    Reject(RejectTransfer),
    Ship(ShipTransfer),
    ReceiveItem(ReceiveItem),
    FinalizeReceipt(FinalizeReceipt),
    Cancel(CancelTransfer),
    GetState,
}

/// Transfer behaviour for the actor runtime. Holds the ledger client used for
/// cross-actor stock movements.
#[derive(Debug, Clone)]
pub struct TransferEntity {
    ledgers: LedgerClient,
    retry: RetryConfig,
}

impl TransferEntity {
    pub fn new(ledgers: LedgerClient, retry: RetryConfig) -> Self {
        Self { ledgers, retry }
    }

    /// Run a ledger call, retrying transient failures with linear backoff.
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ActorError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ActorError>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    warn!(operation, attempt, error = %err, "ledger call failed, retrying");
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Credit `site` with each shipped line. Used for destination receipt and
    /// cancel returns.
    async fn credit_lines(
        &self,
        route: &Route,
        site_id: SiteId,
        lines: &[TransferLine],
        step: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), ActorError> {
        for line in lines {
            let operation_key = route.key.operation_key(line.line_no, step);
            let cmd = ReceiveTransfer {
                key: LedgerKey::new(route.key.tenant_id, site_id, line.ingredient_id),
                operation_key: Some(operation_key.clone()),
                quantity: line.shipped_qty,
                unit_cost: line.shipped_unit_cost,
                source_site_id: route.source_site_id,
                transfer_id: route.key.transfer_id.0,
                occurred_at,
            };
            let ledgers = &self.ledgers;
            self.with_retry(&operation_key, move || ledgers.receive_transfer(cmd.clone()))
                .await?;
        }
        Ok(())
    }

    /// Reverse ship attempt `attempt` on the source ledger for `lines`.
    ///
    /// Every line is tried; the first failure is returned. A ledger that was
    /// never initialized had nothing deducted.
    async fn reverse_attempt(
        &self,
        route: &Route,
        lines: &[TransferLine],
        attempt: u32,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), ActorError> {
        let original = format!("ship:{attempt}");
        let revert = format!("ship:{attempt}:revert");
        let mut result = Ok(());
        for line in lines {
            let operation_key = route.key.operation_key(line.line_no, &revert);
            let cmd = ReverseConsumption {
                key: LedgerKey::new(route.key.tenant_id, route.source_site_id, line.ingredient_id),
                operation_key: operation_key.clone(),
                original_operation_key: route.key.operation_key(line.line_no, &original),
                reason: format!("transfer {} ship attempt {attempt} failed", route.key.transfer_id),
                occurred_at,
            };
            let ledgers = &self.ledgers;
            match self
                .with_retry(&operation_key, move || ledgers.reverse_consumption(cmd.clone()))
                .await
            {
                Ok(_) | Err(ActorError::Domain(DomainError::NotFound)) => {}
                Err(err) => {
                    warn!(transfer = %route.key, %operation_key, error = %err, "reversal failed");
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        result
    }

    /// Replay the reversals of every failed attempt so far.
    async fn settle_failed_attempts(
        &self,
        transfer: &InventoryTransfer,
        route: &Route,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), ActorError> {
        for attempt in 1..=transfer.ship_attempts() {
            self.reverse_attempt(route, transfer.lines(), attempt, occurred_at)
                .await?;
        }
        Ok(())
    }

    async fn ship(
        &self,
        cell: &mut EntityCell<InventoryTransfer>,
        cmd: ShipTransfer,
    ) -> Result<(), ActorError> {
        let transfer = cell.state();
        transfer.ensure_key(cmd.key)?;
        transfer.ensure_can_ship()?;
        let route = Route::of(transfer, cmd.key)?;
        self.settle_failed_attempts(transfer, &route, cmd.occurred_at)
            .await?;
        let attempt = transfer.next_ship_attempt();
        let lines = transfer.lines().to_vec();

        let mut shipped: Vec<TransferLine> = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            let step = format!("ship:{attempt}");
            let operation_key = route.key.operation_key(line.line_no, &step);
            let consume = ConsumeStock {
                key: LedgerKey::new(route.key.tenant_id, route.source_site_id, line.ingredient_id),
                operation_key: Some(operation_key.clone()),
                quantity: line.requested_qty,
                reason: format!("transfer {} to site {}", route.key.transfer_id, route.dest_site_id),
                occurred_at: cmd.occurred_at,
            };
            let ledgers = &self.ledgers;
            let result = self
                .with_retry(&operation_key, move || ledgers.consume(consume.clone()))
                .await;

            match result {
                Ok(outcome) => shipped.push(TransferLine {
                    shipped_qty: line.requested_qty,
                    shipped_value: outcome.costing.total_cost,
                    // Blended cost of what was drawn; a shortfall (source gone
                    // negative) carries no value.
                    shipped_unit_cost: outcome.costing.total_cost / line.requested_qty,
                    ..line.clone()
                }),
                Err(err) => {
                    // After a timeout the consume may still be applied.
                    let touched = if err.is_transient() { index + 1 } else { index };
                    warn!(
                        transfer = %route.key,
                        attempt,
                        line_no = line.line_no,
                        error = %err,
                        "ship attempt failed, reversing consumed lines"
                    );
                    if let Err(comp) = self
                        .reverse_attempt(&route, &lines[..touched], attempt, cmd.occurred_at)
                        .await
                    {
                        error!(
                            transfer = %route.key,
                            attempt,
                            error = %comp,
                            "reversal incomplete; replayed before the next attempt"
                        );
                    }
                    let failure = RecordShipFailure {
                        key: cmd.key,
                        attempt,
                        reason: err.to_string(),
                        occurred_at: cmd.occurred_at,
                    };
                    if let Err(record_err) =
                        cell.execute(&TransferCommand::RecordShipFailure(failure))
                    {
                        error!(
                            transfer = %route.key,
                            attempt,
                            error = %record_err,
                            "could not record the failed ship attempt"
                        );
                    }
                    return Err(err);
                }
            }
        }

        let shipped_lines = shipped
            .iter()
            .map(|l| ShippedLine {
                line_no: l.line_no,
                quantity: l.shipped_qty,
                unit_cost: l.shipped_unit_cost,
                value: l.shipped_value,
            })
            .collect();
        cell.execute(&TransferCommand::RecordShipment(RecordShipment {
            key: cmd.key,
            attempt,
            by: cmd.by,
            tracking_number: cmd.tracking_number,
            lines: shipped_lines,
            occurred_at: cmd.occurred_at,
        }))?;

        info!(
            transfer = %route.key,
            attempt,
            total_value = %cell.state().total_shipped_value(),
            "transfer shipped"
        );
        Ok(())
    }

    async fn finalize(
        &self,
        cell: &mut EntityCell<InventoryTransfer>,
        cmd: FinalizeReceipt,
    ) -> Result<(), ActorError> {
        let transfer = cell.state();
        transfer.ensure_key(cmd.key)?;
        transfer.ensure_can_finalize()?;
        let route = Route::of(transfer, cmd.key)?;
        let lines = transfer.lines().to_vec();

        self.credit_lines(&route, route.dest_site_id, &lines, "receive", cmd.occurred_at)
            .await?;
        cell.execute(&TransferCommand::FinalizeReceipt(cmd))?;

        info!(transfer = %route.key, "transfer received at destination");
        Ok(())
    }

    async fn cancel(
        &self,
        cell: &mut EntityCell<InventoryTransfer>,
        cmd: CancelTransfer,
    ) -> Result<(), ActorError> {
        let transfer = cell.state();
        transfer.ensure_key(cmd.key)?;
        transfer.ensure_can_cancel()?;
        let route = Route::of(transfer, cmd.key)?;
        let lines = transfer.lines().to_vec();
        let returning = cmd.return_stock_to_source && transfer.status() == TransferStatus::Shipped;

        if transfer.status() == TransferStatus::Approved {
            self.settle_failed_attempts(transfer, &route, cmd.occurred_at)
                .await?;
        }
        if returning {
            self.credit_lines(&route, route.source_site_id, &lines, "return", cmd.occurred_at)
                .await?;
        }
        cell.execute(&TransferCommand::Cancel(cmd))?;

        info!(transfer = %route.key, stock_returned = returning, "transfer cancelled");
        Ok(())
    }
}

/// Where a transfer moves stock.
struct Route {
    key: TransferKey,
    source_site_id: SiteId,
    dest_site_id: SiteId,
}

impl Route {
    fn of(transfer: &InventoryTransfer, key: TransferKey) -> Result<Self, DomainError> {
        match (transfer.source_site_id(), transfer.dest_site_id()) {
            (Some(source_site_id), Some(dest_site_id)) => Ok(Self {
                key,
                source_site_id,
                dest_site_id,
            }),
            _ => Err(DomainError::not_found()),
        }
    }
}

fn snapshot(cell: &EntityCell<InventoryTransfer>) -> Result<TransferState, ActorError> {
    cell.state()
        .snapshot()
        .ok_or_else(|| DomainError::not_found().into())
}

#[async_trait]
impl Entity for TransferEntity {
    type Key = TransferKey;
    type Aggregate = InventoryTransfer;
    type Request = TransferRequest;
    type Response = TransferState;

    const KIND: &'static str = larder_transfers::AGGREGATE_TYPE;

    fn tenant_id(key: &TransferKey) -> TenantId {
        key.tenant_id
    }

    fn stream_id(key: &TransferKey) -> AggregateId {
        key.transfer_id.0
    }

    fn empty(key: &TransferKey) -> InventoryTransfer {
        InventoryTransfer::empty(key.transfer_id)
    }

    async fn receive(
        &self,
        cell: &mut EntityCell<InventoryTransfer>,
        request: TransferRequest,
    ) -> Result<TransferState, ActorError> {
        match request {
            TransferRequest::Request(cmd) => {
                cell.execute(&TransferCommand::Request(cmd))?;
            }
            TransferRequest::Approve(cmd) => {
                cell.execute(&TransferCommand::Approve(cmd))?;
            }
            TransferRequest::Reject(cmd) => {
                cell.execute(&TransferCommand::Reject(cmd))?;
            }
            TransferRequest::ReceiveItem(cmd) => {
                cell.execute(&TransferCommand::ReceiveItem(cmd))?;
            }
            TransferRequest::Ship(cmd) => self.ship(cell, cmd).await?,
            TransferRequest::FinalizeReceipt(cmd) => self.finalize(cell, cmd).await?,
            TransferRequest::Cancel(cmd) => self.cancel(cell, cmd).await?,
            TransferRequest::GetState => {}
        }
        snapshot(cell)
    }
}

/// Typed front door to the transfer actors.
#[derive(Debug, Clone)]
pub struct TransferClient {
    runtime: Arc<ActorRuntime<TransferEntity>>,
}

impl TransferClient {
    pub fn new(runtime: Arc<ActorRuntime<TransferEntity>>) -> Self {
        Self { runtime }
    }

    /// Transfer runtime over `store`, moving stock through `ledgers`.
    pub fn spawn(
        store: Arc<dyn EventStore>,
        ledgers: LedgerClient,
        runtime: RuntimeConfig,
        retry: RetryConfig,
    ) -> Self {
        Self::new(Arc::new(ActorRuntime::new(
            TransferEntity::new(ledgers, retry),
            store,
            runtime,
        )))
    }

    pub fn runtime(&self) -> &ActorRuntime<TransferEntity> {
        &self.runtime
    }

    pub async fn request(&self, cmd: RequestTransfer) -> Result<TransferState, ActorError> {
        self.runtime.ask(cmd.key, TransferRequest::Request(cmd)).await
    }

    pub async fn approve(&self, cmd: ApproveTransfer) -> Result<TransferState, ActorError> {
        self.runtime.ask(cmd.key, TransferRequest::Approve(cmd)).await
    }

    pub async fn reject(&self, cmd: RejectTransfer) -> Result<TransferState, ActorError> {
        self.runtime.ask(cmd.key, TransferRequest::Reject(cmd)).await
    }

    pub async fn ship(&self, cmd: ShipTransfer) -> Result<TransferState, ActorError> {
        self.runtime.ask(cmd.key, TransferRequest::Ship(cmd)).await
    }

    pub async fn receive_item(&self, cmd: ReceiveItem) -> Result<TransferState, ActorError> {
        self.runtime.ask(cmd.key, TransferRequest::ReceiveItem(cmd)).await
    }

    pub async fn finalize_receipt(
        &self,
        cmd: FinalizeReceipt,
    ) -> Result<TransferState, ActorError> {
        self.runtime
            .ask(cmd.key, TransferRequest::FinalizeReceipt(cmd))
            .await
    }

    pub async fn cancel(&self, cmd: CancelTransfer) -> Result<TransferState, ActorError> {
        self.runtime.ask(cmd.key, TransferRequest::Cancel(cmd)).await
    }

    pub async fn state(&self, key: TransferKey) -> Result<TransferState, ActorError> {
        self.runtime.ask(key, TransferRequest::GetState).await
    }
}
