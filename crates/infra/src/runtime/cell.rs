//! Entity state owned by a live actor, plus the load / decide / commit /
//! evolve pipeline every entity command goes through.
//!
//! ```text
//! activation:  load stream -> validate -> rehydrate
//! command:     handle (pure) -> append (optimistic) -> apply
//! ```
//!
//! The actor is the only writer of its stream, so the in-memory state and
//! revision stay authoritative between commands; the store is read only on
//! activation.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use larder_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, TenantId};
use larder_events::Event;

use crate::error::ActorError;
use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

pub struct EntityCell<A> {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
    aggregate_type: &'static str,
    store: Arc<dyn EventStore>,
    state: A,
    /// Stream revision the next append expects.
    revision: u64,
}

impl<A> core::fmt::Debug for EntityCell<A>
where
    A: core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntityCell")
            .field("tenant_id", &self.tenant_id)
            .field("aggregate_id", &self.aggregate_id)
            .field("aggregate_type", &self.aggregate_type)
            .field("revision", &self.revision)
            .field("state", &self.state)
            .finish()
    }
}

impl<A> EntityCell<A>
where
    A: Aggregate<Error = DomainError>,
    A::Event: Event + Serialize + DeserializeOwned,
{
    /// Rehydrate `empty` from the stored stream.
    pub fn load(
        store: Arc<dyn EventStore>,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &'static str,
        empty: A,
    ) -> Result<Self, ActorError> {
        let history = store.load_stream(tenant_id, aggregate_id)?;
        validate_loaded_stream(tenant_id, aggregate_id, &history)?;

        let mut state = empty;
        apply_history(&mut state, &history)?;

        debug!(
            aggregate_type,
            %aggregate_id,
            replayed = history.len(),
            "entity rehydrated"
        );

        Ok(Self {
            tenant_id,
            aggregate_id,
            aggregate_type,
            store,
            state,
            revision: stream_version(&history),
        })
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Decide, persist, then evolve. Returns the committed events (empty when
    /// the command was a no-op, e.g. a replayed operation key).
    ///
    /// Nothing is applied unless the append succeeded, so a failed command
    /// leaves the state untouched.
    pub fn execute(&mut self, command: &A::Command) -> Result<Vec<A::Event>, ActorError> {
        let decided = self.state.handle(command)?;
        if decided.is_empty() {
            return Ok(decided);
        }

        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    self.tenant_id,
                    self.aggregate_id,
                    self.aggregate_type,
                    Uuid::now_v7(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self
            .store
            .append(uncommitted, ExpectedVersion::Exact(self.revision))?;
        if let Some(last) = committed.last() {
            self.revision = last.sequence_number;
        }

        for ev in &decided {
            self.state.apply(ev);
        }

        debug!(
            aggregate_type = self.aggregate_type,
            aggregate_id = %self.aggregate_id,
            revision = self.revision,
            events = decided.len(),
            "command committed"
        );

        Ok(decided)
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    tenant_id: TenantId,
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), ActorError> {
    // Enforce tenant isolation even if a buggy backend returns cross-tenant data.
    // Also ensure the stream is monotonically increasing by sequence number.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.tenant_id != tenant_id {
            return Err(ActorError::TenantIsolation(format!(
                "loaded stream contains wrong tenant_id at index {idx}"
            )));
        }
        if e.aggregate_id != aggregate_id {
            return Err(ActorError::TenantIsolation(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number <= last {
            return Err(ActorError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), ActorError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| ActorError::Deserialize(format!("{}: {e}", stored.event_type)))?;
        aggregate.apply(&ev);
    }

    Ok(())
}
