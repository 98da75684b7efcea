//! Stock ledger actors: one per (tenant, site, ingredient).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;

use larder_core::{AggregateId, TenantId};
use larder_costing::{CostingMethod, CostingPolicyFactory, CostingResult, StockBatch};
use larder_inventory::{
    AdjustStock, ConsumeStock, ConsumptionOutcome, InitializeLedger, InventoryCommand,
    InventoryEvent, InventoryState, LedgerKey, LedgerOutcome, LevelInfo, ReceiptOutcome,
    ReceiveBatch, ReceiveTransfer, ReversalOutcome, ReverseConsumption, StockLedger, StockLevel,
};

use crate::config::RuntimeConfig;
use crate::error::ActorError;
use crate::event_store::EventStore;
use crate::runtime::{ActorRuntime, Entity, EntityCell};

#[derive(Debug, Clone)]
pub enum LedgerRequest {
    Initialize(InitializeLedger),
    ReceiveBatch(ReceiveBatch),
    Consume(ConsumeStock),
    ReceiveTransfer(ReceiveTransfer),
    Adjust(AdjustStock),
    ReverseConsumption(ReverseConsumption),
    GetLevelInfo,
    GetStockLevel,
    GetActiveBatches,
    GetState,
    ValueStock {
        method: CostingMethod,
        quantity: Decimal,
        as_of: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub enum LedgerResponse {
    Initialized,
    Received(ReceiptOutcome),
    Consumed(ConsumptionOutcome),
    Adjusted(LedgerOutcome),
    Reversed(ReversalOutcome),
    LevelInfo(LevelInfo),
    StockLevel(StockLevel),
    ActiveBatches(Vec<StockBatch>),
    State(InventoryState),
    Valuation(CostingResult),
}

/// Stock ledger behaviour for the actor runtime.
#[derive(Debug, Clone, Default)]
pub struct LedgerEntity {
    costing: CostingPolicyFactory,
}

impl LedgerEntity {
    pub fn new(costing: CostingPolicyFactory) -> Self {
        Self { costing }
    }
}

/// Outcome of a keyed or freshly committed movement.
///
/// A replayed operation key commits nothing, so the outcome recorded the
/// first time is returned instead.
fn movement_outcome(
    ledger: &StockLedger,
    operation_key: Option<&str>,
    committed: &[InventoryEvent],
) -> Result<LedgerOutcome, ActorError> {
    if let Some(outcome) = operation_key.and_then(|op| ledger.recorded_outcome(op)) {
        return Ok(outcome.clone());
    }
    committed
        .iter()
        .find_map(|ev| ledger.outcome_of(ev))
        .ok_or_else(|| ActorError::UnexpectedResponse("movement committed no outcome".to_string()))
}

fn ensure_initialized(ledger: &StockLedger) -> Result<(), ActorError> {
    if ledger.is_initialized() {
        Ok(())
    } else {
        Err(larder_core::DomainError::not_found().into())
    }
}

#[async_trait]
impl Entity for LedgerEntity {
    type Key = LedgerKey;
    type Aggregate = StockLedger;
    type Request = LedgerRequest;
    type Response = LedgerResponse;

    const KIND: &'static str = larder_inventory::AGGREGATE_TYPE;

    fn tenant_id(key: &LedgerKey) -> TenantId {
        key.tenant_id
    }

    fn stream_id(key: &LedgerKey) -> AggregateId {
        key.ledger_id().0
    }

    fn empty(key: &LedgerKey) -> StockLedger {
        StockLedger::empty(key.ledger_id())
    }

    async fn receive(
        &self,
        cell: &mut EntityCell<StockLedger>,
        request: LedgerRequest,
    ) -> Result<LedgerResponse, ActorError> {
        match request {
            LedgerRequest::Initialize(cmd) => {
                let key = cmd.key;
                cell.execute(&InventoryCommand::InitializeLedger(cmd))?;
                info!(ledger = %key, "ledger initialized");
                Ok(LedgerResponse::Initialized)
            }
            LedgerRequest::ReceiveBatch(cmd) => {
                let op = cmd.operation_key.clone();
                let committed = cell.execute(&InventoryCommand::ReceiveBatch(cmd))?;
                match movement_outcome(cell.state(), op.as_deref(), &committed)? {
                    LedgerOutcome::Received(outcome) => Ok(LedgerResponse::Received(outcome)),
                    other => Err(ActorError::unexpected(other)),
                }
            }
            LedgerRequest::Consume(cmd) => {
                let op = cmd.operation_key.clone();
                let committed = cell.execute(&InventoryCommand::ConsumeStock(cmd))?;
                match movement_outcome(cell.state(), op.as_deref(), &committed)? {
                    LedgerOutcome::Consumed(outcome) => Ok(LedgerResponse::Consumed(outcome)),
                    other => Err(ActorError::unexpected(other)),
                }
            }
            LedgerRequest::ReceiveTransfer(cmd) => {
                let op = cmd.operation_key.clone();
                let committed = cell.execute(&InventoryCommand::ReceiveTransfer(cmd))?;
                match movement_outcome(cell.state(), op.as_deref(), &committed)? {
                    LedgerOutcome::Received(outcome) => Ok(LedgerResponse::Received(outcome)),
                    other => Err(ActorError::unexpected(other)),
                }
            }
            LedgerRequest::Adjust(cmd) => {
                let op = cmd.operation_key.clone();
                let committed = cell.execute(&InventoryCommand::AdjustStock(cmd))?;
                movement_outcome(cell.state(), op.as_deref(), &committed)
                    .map(LedgerResponse::Adjusted)
            }
            LedgerRequest::ReverseConsumption(cmd) => {
                let op = cmd.operation_key.clone();
                let committed = cell.execute(&InventoryCommand::ReverseConsumption(cmd))?;
                match movement_outcome(cell.state(), Some(&op), &committed)? {
                    LedgerOutcome::Reversal(outcome) => Ok(LedgerResponse::Reversed(outcome)),
                    other => Err(ActorError::unexpected(other)),
                }
            }
            LedgerRequest::GetLevelInfo => {
                ensure_initialized(cell.state())?;
                Ok(LedgerResponse::LevelInfo(cell.state().level_info()))
            }
            LedgerRequest::GetStockLevel => {
                ensure_initialized(cell.state())?;
                Ok(LedgerResponse::StockLevel(cell.state().stock_level()))
            }
            LedgerRequest::GetActiveBatches => {
                ensure_initialized(cell.state())?;
                Ok(LedgerResponse::ActiveBatches(cell.state().active_batches()))
            }
            LedgerRequest::GetState => cell
                .state()
                .snapshot()
                .map(LedgerResponse::State)
                .ok_or_else(|| larder_core::DomainError::not_found().into()),
            LedgerRequest::ValueStock {
                method,
                quantity,
                as_of,
            } => {
                let ledger = cell.state();
                ensure_initialized(ledger)?;
                let key = ledger
                    .key()
                    .ok_or_else(|| ActorError::from(larder_core::DomainError::not_found()))?;
                let policy = self.costing.create(method, key.ingredient_id);
                Ok(LedgerResponse::Valuation(ledger.value_stock(
                    policy.as_ref(),
                    quantity,
                    as_of,
                )))
            }
        }
    }
}

/// Typed front door to the stock ledger actors.
#[derive(Debug, Clone)]
pub struct LedgerClient {
    runtime: Arc<ActorRuntime<LedgerEntity>>,
}

impl LedgerClient {
    pub fn new(runtime: Arc<ActorRuntime<LedgerEntity>>) -> Self {
        Self { runtime }
    }

    /// Runtime with default costing policies over `store`.
    pub fn spawn(store: Arc<dyn EventStore>, config: RuntimeConfig) -> Self {
        Self::new(Arc::new(ActorRuntime::new(
            LedgerEntity::default(),
            store,
            config,
        )))
    }

    pub fn runtime(&self) -> &ActorRuntime<LedgerEntity> {
        &self.runtime
    }

    pub async fn initialize(&self, cmd: InitializeLedger) -> Result<(), ActorError> {
        match self.runtime.ask(cmd.key, LedgerRequest::Initialize(cmd)).await? {
            LedgerResponse::Initialized => Ok(()),
            other => Err(ActorError::unexpected(other)),
        }
    }

    pub async fn receive_batch(&self, cmd: ReceiveBatch) -> Result<ReceiptOutcome, ActorError> {
        match self.runtime.ask(cmd.key, LedgerRequest::ReceiveBatch(cmd)).await? {
            LedgerResponse::Received(outcome) => Ok(outcome),
            other => Err(ActorError::unexpected(other)),
        }
    }

    pub async fn consume(&self, cmd: ConsumeStock) -> Result<ConsumptionOutcome, ActorError> {
        match self.runtime.ask(cmd.key, LedgerRequest::Consume(cmd)).await? {
            LedgerResponse::Consumed(outcome) => Ok(outcome),
            other => Err(ActorError::unexpected(other)),
        }
    }

    pub async fn receive_transfer(
        &self,
        cmd: ReceiveTransfer,
    ) -> Result<ReceiptOutcome, ActorError> {
        match self
            .runtime
            .ask(cmd.key, LedgerRequest::ReceiveTransfer(cmd))
            .await?
        {
            LedgerResponse::Received(outcome) => Ok(outcome),
            other => Err(ActorError::unexpected(other)),
        }
    }

    pub async fn adjust(&self, cmd: AdjustStock) -> Result<LedgerOutcome, ActorError> {
        match self.runtime.ask(cmd.key, LedgerRequest::Adjust(cmd)).await? {
            LedgerResponse::Adjusted(outcome) => Ok(outcome),
            other => Err(ActorError::unexpected(other)),
        }
    }

    /// Undo a keyed withdrawal whether or not it was applied. Once this
    /// returns, the original operation key can never deduct stock.
    pub async fn reverse_consumption(
        &self,
        cmd: ReverseConsumption,
    ) -> Result<ReversalOutcome, ActorError> {
        match self
            .runtime
            .ask(cmd.key, LedgerRequest::ReverseConsumption(cmd))
            .await?
        {
            LedgerResponse::Reversed(outcome) => Ok(outcome),
            other => Err(ActorError::unexpected(other)),
        }
    }

    pub async fn level_info(&self, key: LedgerKey) -> Result<LevelInfo, ActorError> {
        match self.runtime.ask(key, LedgerRequest::GetLevelInfo).await? {
            LedgerResponse::LevelInfo(info) => Ok(info),
            other => Err(ActorError::unexpected(other)),
        }
    }

    pub async fn stock_level(&self, key: LedgerKey) -> Result<StockLevel, ActorError> {
        match self.runtime.ask(key, LedgerRequest::GetStockLevel).await? {
            LedgerResponse::StockLevel(level) => Ok(level),
            other => Err(ActorError::unexpected(other)),
        }
    }

    pub async fn active_batches(&self, key: LedgerKey) -> Result<Vec<StockBatch>, ActorError> {
        match self.runtime.ask(key, LedgerRequest::GetActiveBatches).await? {
            LedgerResponse::ActiveBatches(batches) => Ok(batches),
            other => Err(ActorError::unexpected(other)),
        }
    }

    pub async fn state(&self, key: LedgerKey) -> Result<InventoryState, ActorError> {
        match self.runtime.ask(key, LedgerRequest::GetState).await? {
            LedgerResponse::State(state) => Ok(state),
            other => Err(ActorError::unexpected(other)),
        }
    }

    pub async fn value_stock(
        &self,
        key: LedgerKey,
        method: CostingMethod,
        quantity: Decimal,
        as_of: DateTime<Utc>,
    ) -> Result<CostingResult, ActorError> {
        let request = LedgerRequest::ValueStock {
            method,
            quantity,
            as_of,
        };
        match self.runtime.ask(key, request).await? {
            LedgerResponse::Valuation(result) => Ok(result),
            other => Err(ActorError::unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use larder_core::{DomainError, IngredientId, SiteId};
    use larder_events::{EventBus, EventEnvelope, InMemoryEventBus};
    use rust_decimal_macros::dec;

    use crate::event_store::{InMemoryEventStore, PublishingEventStore};

    fn test_key() -> LedgerKey {
        LedgerKey::new(TenantId::new(), SiteId::new(), IngredientId::new())
    }

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig {
            mailbox_capacity: 8,
            idle_timeout_ms: 60_000,
            call_timeout_ms: 2_000,
        }
    }

    fn client() -> LedgerClient {
        LedgerClient::spawn(Arc::new(InMemoryEventStore::new()), fast_config())
    }

    async fn initialize(client: &LedgerClient, key: LedgerKey, reorder_point: Decimal) {
        client
            .initialize(InitializeLedger {
                key,
                name: "Whole milk".to_string(),
                sku: Some("DA-014".to_string()),
                unit: "l".to_string(),
                category: Some("dairy".to_string()),
                reorder_point,
                par_level: dec!(40),
                occurred_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    fn receive(key: LedgerKey, number: &str, quantity: Decimal, unit_cost: Decimal) -> ReceiveBatch {
        ReceiveBatch {
            key,
            operation_key: None,
            batch_number: number.to_string(),
            quantity,
            unit_cost,
            occurred_at: Utc::now(),
        }
    }

    fn consume(key: LedgerKey, quantity: Decimal, operation_key: Option<&str>) -> ConsumeStock {
        ConsumeStock {
            key,
            operation_key: operation_key.map(str::to_string),
            quantity,
            reason: "service".to_string(),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn negative_stock_scenario() {
        let client = client();
        let key = test_key();
        initialize(&client, key, dec!(0)).await;

        client
            .receive_batch(receive(key, "BATCH-001", dec!(10), dec!(5)))
            .await
            .unwrap();
        let consumed = client.consume(consume(key, dec!(15), None)).await.unwrap();

        assert_eq!(consumed.quantity_on_hand, dec!(-5));
        assert_eq!(consumed.deficit_added, dec!(5));
        assert_eq!(consumed.costing.total_cost, dec!(50));

        let info = client.level_info(key).await.unwrap();
        assert_eq!(info.unbatched_deficit, dec!(5));
        assert_eq!(info.weighted_average_cost, dec!(0));
        assert_eq!(info.level, StockLevel::OutOfStock);
        assert!(client.active_batches(key).await.unwrap().is_empty());

        let state = client.state(key).await.unwrap();
        assert_eq!(state.batches[0].batch_number(), "BATCH-001");
        assert_eq!(state.batches[0].quantity(), dec!(0));

        let absorbed = client
            .receive_batch(receive(key, "BATCH-002", dec!(5), dec!(6)))
            .await
            .unwrap();
        assert_eq!(absorbed.created_batch_id, None);
        assert_eq!(absorbed.quantity_on_hand, dec!(0));
    }

    #[tokio::test]
    async fn replayed_operation_key_returns_recorded_outcome() {
        let client = client();
        let key = test_key();
        initialize(&client, key, dec!(0)).await;
        client
            .receive_batch(receive(key, "A", dec!(10), dec!(3)))
            .await
            .unwrap();

        let first = client
            .consume(consume(key, dec!(4), Some("pos:ticket-88")))
            .await
            .unwrap();
        let replay = client
            .consume(consume(key, dec!(4), Some("pos:ticket-88")))
            .await
            .unwrap();

        assert_eq!(first, replay);
        let info = client.level_info(key).await.unwrap();
        assert_eq!(info.quantity_on_hand, dec!(6));
    }

    #[tokio::test]
    async fn concurrent_senders_are_serialized() {
        let client = client();
        let key = test_key();
        initialize(&client, key, dec!(0)).await;
        client
            .receive_batch(receive(key, "A", dec!(100), dec!(1)))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.consume(consume(key, dec!(3), None)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let state = client.state(key).await.unwrap();
        assert_eq!(state.quantity_on_hand, dec!(-50));
        assert_eq!(state.unbatched_deficit, dec!(50));
        // 1 init + 1 receive + 50 consumes + 2 level changes.
        assert_eq!(state.version, 54);
    }

    #[tokio::test]
    async fn evicted_actor_reloads_from_the_store() {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let client = LedgerClient::spawn(
            store,
            RuntimeConfig {
                idle_timeout_ms: 30,
                ..fast_config()
            },
        );
        let key = test_key();
        initialize(&client, key, dec!(5)).await;
        client
            .receive_batch(receive(key, "A", dec!(12), dec!(2)))
            .await
            .unwrap();
        assert!(client.runtime().is_live(&key));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!client.runtime().is_live(&key));

        let info = client.level_info(key).await.unwrap();
        assert_eq!(info.quantity_on_hand, dec!(12));
        assert_eq!(info.level, StockLevel::Normal);
        assert!(client.runtime().is_live(&key));
    }

    #[tokio::test]
    async fn queries_on_unknown_ledger_are_not_found() {
        let client = client();
        let err = client.level_info(test_key()).await.unwrap_err();
        assert_eq!(err, ActorError::Domain(DomainError::NotFound));
        let err = client.state(test_key()).await.unwrap_err();
        assert_eq!(err, ActorError::Domain(DomainError::NotFound));
    }

    #[tokio::test]
    async fn valuation_uses_the_requested_method() {
        let client = client();
        let key = test_key();
        initialize(&client, key, dec!(0)).await;
        client
            .receive_batch(receive(key, "1", dec!(100), dec!(5)))
            .await
            .unwrap();
        client
            .receive_batch(receive(key, "2", dec!(100), dec!(7)))
            .await
            .unwrap();
        client
            .receive_batch(receive(key, "3", dec!(50), dec!(8)))
            .await
            .unwrap();

        let wac = client
            .value_stock(key, CostingMethod::WeightedAverage, dec!(150), Utc::now())
            .await
            .unwrap();
        assert_eq!(wac.unit_cost, dec!(6.4));
        assert_eq!(wac.total_cost, dec!(960));

        let fifo = client
            .value_stock(key, CostingMethod::Fifo, dec!(150), Utc::now())
            .await
            .unwrap();
        assert_eq!(fifo.total_cost, dec!(850)); // 100 x 5 + 50 x 7

        // Valuation never moves stock.
        let info = client.level_info(key).await.unwrap();
        assert_eq!(info.quantity_on_hand, dec!(250));
    }

    #[tokio::test]
    async fn reversed_withdrawal_cannot_land_afterwards() {
        let client = client();
        let key = test_key();
        initialize(&client, key, dec!(0)).await;
        client
            .receive_batch(receive(key, "A", dec!(10), dec!(3)))
            .await
            .unwrap();

        let reverse = |original: &str| ReverseConsumption {
            key,
            operation_key: format!("{original}:revert"),
            original_operation_key: original.to_string(),
            reason: "shipment failed".to_string(),
            occurred_at: Utc::now(),
        };

        client
            .consume(consume(key, dec!(4), Some("transfer:9:line:1:ship:1")))
            .await
            .unwrap();
        let restored = client
            .reverse_consumption(reverse("transfer:9:line:1:ship:1"))
            .await
            .unwrap();
        assert_eq!(restored.quantity_restored, dec!(4));
        assert_eq!(restored.value_restored, dec!(12));
        assert_eq!(restored.quantity_on_hand, dec!(10));

        // Reversing first leaves nothing to restore but blocks the key.
        let nothing = client
            .reverse_consumption(reverse("transfer:9:line:2:ship:1"))
            .await
            .unwrap();
        assert_eq!(nothing.quantity_restored, dec!(0));
        let err = client
            .consume(consume(key, dec!(4), Some("transfer:9:line:2:ship:1")))
            .await
            .unwrap_err();
        assert!(matches!(err, ActorError::Domain(DomainError::Conflict(_))));

        assert_eq!(client.level_info(key).await.unwrap().quantity_on_hand, dec!(10));
    }

    #[tokio::test]
    async fn shutdown_stops_every_actor_and_refuses_new_work() {
        let client = client();
        let key = test_key();
        initialize(&client, key, dec!(0)).await;

        let queued: Vec<_> = (0..5)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.consume(consume(key, dec!(1), None)).await })
            })
            .collect();
        tokio::task::yield_now().await;

        client.runtime().shutdown().await;
        assert!(client.runtime().is_shut_down());
        assert_eq!(client.runtime().live_actors(), 0);

        for handle in queued {
            // Sent before shutdown: served. Sent after: refused.
            match handle.await.unwrap() {
                Ok(_) | Err(ActorError::Unavailable(_)) => {}
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        let err = client.level_info(key).await.unwrap_err();
        assert!(matches!(err, ActorError::Unavailable(_)));
        assert!(!client.runtime().is_live(&key));
    }

    #[tokio::test]
    async fn level_changes_reach_bus_subscribers() {
        let bus: Arc<InMemoryEventBus<EventEnvelope<serde_json::Value>>> =
            Arc::new(InMemoryEventBus::new());
        let subscription = bus.subscribe();
        let store: Arc<dyn EventStore> = Arc::new(PublishingEventStore::new(
            InMemoryEventStore::new(),
            bus.clone(),
        ));
        let client = LedgerClient::spawn(store, fast_config());
        let key = test_key();
        initialize(&client, key, dec!(4)).await;

        client
            .receive_batch(receive(key, "A", dec!(10), dec!(1)))
            .await
            .unwrap();
        client.consume(consume(key, dec!(7), None)).await.unwrap();

        let types: Vec<String> = subscription
            .drain()
            .iter()
            .map(|e| e.event_type().to_string())
            .collect();
        assert_eq!(
            types,
            vec![
                "inventory.ledger.initialized",
                "inventory.ledger.stock_received",
                "inventory.ledger.level_changed",
                "inventory.ledger.stock_consumed",
                "inventory.ledger.level_changed",
            ]
        );
    }
}
