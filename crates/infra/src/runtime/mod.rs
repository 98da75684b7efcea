//! Entity actor runtime.
//!
//! Every entity key (a stock ledger, a transfer) is served by at most one live
//! tokio task that owns the entity's state and processes its bounded mailbox
//! one request at a time, in arrival order. Tasks are spawned on first use
//! (rehydrating from the event store) and stop after an idle timeout.

mod actor;
mod cell;

pub use actor::ActorRuntime;
pub use cell::EntityCell;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use larder_core::{Aggregate, AggregateId, DomainError, TenantId};

use crate::error::ActorError;

/// Behaviour of one kind of entity actor.
///
/// The implementing value is shared by every live actor of that kind, so it
/// is where cross-actor dependencies (clients of other runtimes, costing
/// policies) live.
#[async_trait]
pub trait Entity: Send + Sync + 'static {
    type Key: Copy
        + Eq
        + core::hash::Hash
        + core::fmt::Debug
        + core::fmt::Display
        + Send
        + Sync
        + 'static;
    type Aggregate: Aggregate<
            Error = DomainError,
            Event: larder_events::Event + Serialize + DeserializeOwned,
        > + Send
        + Sync
        + 'static;
    type Request: core::fmt::Debug + Send + 'static;
    type Response: Send + 'static;

    /// Aggregate type name recorded on every stored event.
    const KIND: &'static str;

    fn tenant_id(key: &Self::Key) -> TenantId;

    fn stream_id(key: &Self::Key) -> AggregateId;

    /// Fresh, not-yet-created state for `key`, ready for replay.
    fn empty(key: &Self::Key) -> Self::Aggregate;

    /// Serve one request. Runs inside the actor's turn: nothing else reaches
    /// this entity until it returns.
    async fn receive(
        &self,
        cell: &mut EntityCell<Self::Aggregate>,
        request: Self::Request,
    ) -> Result<Self::Response, ActorError>;
}
