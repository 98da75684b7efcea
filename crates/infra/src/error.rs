use thiserror::Error;

use larder_core::DomainError;

use crate::event_store::EventStoreError;

/// Failure of a request sent to an entity actor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActorError {
    /// The entity rejected the command (deterministic; never retried).
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Appending or loading the entity's stream failed.
    #[error("event store: {0}")]
    Store(#[from] EventStoreError),

    /// A stored payload could not be decoded into the entity's event type.
    #[error("failed to decode stored event: {0}")]
    Deserialize(String),

    /// A loaded stream carried events from another tenant or stream.
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// No reply within the call timeout. The request may still be processed.
    #[error("{entity} {key} did not answer within {timeout_ms}ms")]
    Timeout {
        entity: &'static str,
        key: String,
        timeout_ms: u64,
    },

    /// The actor could not be reached (stopped, failed to load, lock poisoned).
    #[error("actor unavailable: {0}")]
    Unavailable(String),

    /// The actor replied with a response of the wrong kind.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ActorError {
    /// Failures worth retrying: the request either never reached the actor or
    /// lost a race on the stream revision.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ActorError::Timeout { .. }
                | ActorError::Unavailable(_)
                | ActorError::Store(EventStoreError::Concurrency(_))
        )
    }

    pub fn unexpected(response: impl core::fmt::Debug) -> Self {
        ActorError::UnexpectedResponse(format!("{response:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_delivery_failures_are_transient() {
        assert!(ActorError::Unavailable("stopped".into()).is_transient());
        assert!(
            ActorError::Timeout {
                entity: "inventory.ledger",
                key: "k".into(),
                timeout_ms: 10,
            }
            .is_transient()
        );
        assert!(ActorError::Store(EventStoreError::Concurrency("stale".into())).is_transient());

        assert!(!ActorError::Domain(DomainError::validation("bad")).is_transient());
        assert!(!ActorError::Store(EventStoreError::InvalidAppend("x".into())).is_transient());
        assert!(!ActorError::TenantIsolation("x".into()).is_transient());
    }

    #[test]
    fn domain_errors_display_unchanged() {
        let err: ActorError = DomainError::conflict("cannot ship while in state Requested").into();
        assert_eq!(
            err.to_string(),
            "conflict: cannot ship while in state Requested"
        );
    }
}
