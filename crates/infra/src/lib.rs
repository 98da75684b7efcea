//! Infrastructure layer: event store, configuration, the entity actor runtime
//! and the actors built on it (stock ledgers, transfer coordinators).

pub mod config;
pub mod error;
pub mod event_store;
pub mod ledger;
pub mod runtime;
pub mod transfer;

pub use config::{LarderConfig, RetryConfig, RuntimeConfig};
pub use error::ActorError;
pub use event_store::{
    EventStore, EventStoreError, InMemoryEventStore, PublishingEventStore, StoredEvent,
    UncommittedEvent,
};
pub use ledger::{LedgerClient, LedgerEntity, LedgerRequest, LedgerResponse};
pub use runtime::{ActorRuntime, Entity, EntityCell};
pub use transfer::{ShipTransfer, TransferClient, TransferEntity, TransferRequest};
