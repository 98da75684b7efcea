//! Scenario runner: one commissary supplying one bistro, end to end through
//! the actor runtime. Prints a JSON report of the resulting ledgers.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use larder_core::{AggregateId, IngredientId, SiteId, TenantId, UserId};
use larder_costing::CostingMethod;
use larder_events::{EventBus, EventEnvelope, InMemoryEventBus};
use larder_infra::transfer::{
    ApproveTransfer, ReceiveItem, RequestTransfer, TransferLineRequest,
};
use larder_infra::{
    EventStore, InMemoryEventStore, LarderConfig, LedgerClient, PublishingEventStore,
    ShipTransfer, TransferClient,
};
use larder_inventory::{ConsumeStock, InitializeLedger, LedgerKey, ReceiveBatch};
use larder_transfers::{FinalizeReceipt, TransferId, TransferKey};

type Bus = InMemoryEventBus<EventEnvelope<serde_json::Value>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    larder_observability::init();

    let config = LarderConfig::load().context("loading larder configuration")?;
    tracing::info!(?config, "starting scenario");

    let bus: Arc<Bus> = Arc::new(InMemoryEventBus::new());
    let level_changes = bus.subscribe();
    let store: Arc<dyn EventStore> = Arc::new(PublishingEventStore::new(
        InMemoryEventStore::new(),
        bus.clone(),
    ));

    let ledgers = LedgerClient::spawn(store.clone(), config.runtime.clone());
    let transfers = TransferClient::spawn(
        store,
        ledgers.clone(),
        config.runtime.clone(),
        config.retry.clone(),
    );

    let tenant = TenantId::new();
    let commissary = SiteId::new();
    let bistro = SiteId::new();
    let flour = IngredientId::new();
    let chef = UserId::new();

    let commissary_flour = LedgerKey::new(tenant, commissary, flour);
    let bistro_flour = LedgerKey::new(tenant, bistro, flour);

    for (key, reorder_point) in [(commissary_flour, dec!(40)), (bistro_flour, dec!(10))] {
        ledgers
            .initialize(InitializeLedger {
                key,
                name: "Bread flour".to_string(),
                sku: Some("FLR-25".to_string()),
                unit: "kg".to_string(),
                category: Some("dry goods".to_string()),
                reorder_point,
                par_level: reorder_point * dec!(3),
                occurred_at: Utc::now(),
            })
            .await?;
    }

    receive(&ledgers, commissary_flour, "PO-1001", dec!(100), dec!(5.00)).await?;
    receive(&ledgers, commissary_flour, "PO-1002", dec!(50), dec!(9.20)).await?;

    // The bistro bakes before any delivery arrives.
    let early = ledgers
        .consume(ConsumeStock {
            key: bistro_flour,
            operation_key: Some("prep:morning".to_string()),
            quantity: dec!(6),
            reason: "morning bake".to_string(),
            occurred_at: Utc::now(),
        })
        .await?;
    tracing::info!(
        quantity_on_hand = %early.quantity_on_hand,
        deficit_added = %early.deficit_added,
        "bistro ran negative"
    );

    let key = TransferKey::new(tenant, TransferId::new(AggregateId::new()));
    transfers
        .request(RequestTransfer {
            key,
            source_site_id: commissary,
            dest_site_id: bistro,
            lines: vec![TransferLineRequest {
                ingredient_id: flour,
                quantity: dec!(120),
            }],
            requested_by: chef,
            occurred_at: Utc::now(),
        })
        .await?;
    transfers
        .approve(ApproveTransfer {
            key,
            by: chef,
            occurred_at: Utc::now(),
        })
        .await?;
    transfers
        .ship(ShipTransfer {
            key,
            by: chef,
            tracking_number: Some("VAN-3".to_string()),
            occurred_at: Utc::now(),
        })
        .await?;
    transfers
        .receive_item(ReceiveItem {
            key,
            ingredient_id: flour,
            received_qty: dec!(118),
            by: chef,
            condition: Some("one sack split".to_string()),
            notes: None,
            occurred_at: Utc::now(),
        })
        .await?;
    let transfer = transfers
        .finalize_receipt(FinalizeReceipt {
            key,
            by: chef,
            occurred_at: Utc::now(),
        })
        .await?;

    let mut valuations = serde_json::Map::new();
    for method in [
        CostingMethod::Fifo,
        CostingMethod::Lifo,
        CostingMethod::WeightedAverage,
        CostingMethod::Standard,
    ] {
        let result = ledgers
            .value_stock(bistro_flour, method, dec!(20), Utc::now())
            .await?;
        valuations.insert(method.to_string(), serde_json::to_value(result)?);
    }

    let level_events: Vec<serde_json::Value> = level_changes
        .drain()
        .into_iter()
        .filter(|e| e.event_type() == "inventory.ledger.level_changed")
        .map(EventEnvelope::into_payload)
        .collect();

    let report = json!({
        "commissary": ledgers.level_info(commissary_flour).await?,
        "bistro": ledgers.level_info(bistro_flour).await?,
        "bistro_batches": ledgers.active_batches(bistro_flour).await?,
        "bistro_valuation_of_20kg": valuations,
        "transfer": transfer,
        "level_changes": level_events,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    // Transfers call into ledgers, so they stop first.
    transfers.runtime().shutdown().await;
    ledgers.runtime().shutdown().await;
    Ok(())
}

async fn receive(
    ledgers: &LedgerClient,
    key: LedgerKey,
    batch_number: &str,
    quantity: Decimal,
    unit_cost: Decimal,
) -> anyhow::Result<()> {
    let outcome = ledgers
        .receive_batch(ReceiveBatch {
            key,
            operation_key: Some(format!("delivery:{batch_number}")),
            batch_number: batch_number.to_string(),
            quantity,
            unit_cost,
            occurred_at: Utc::now(),
        })
        .await
        .with_context(|| format!("receiving {batch_number}"))?;
    tracing::info!(
        batch_number,
        quantity_on_hand = %outcome.quantity_on_hand,
        "delivery received"
    );
    Ok(())
}
