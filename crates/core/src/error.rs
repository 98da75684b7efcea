//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic business failures only (validation, invariants, lifecycle
/// conflicts). Negative stock is not represented here: over-consumption is a
/// recorded deficit, never an error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. non-positive quantity).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated (e.g. tenant or key mismatch).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The addressed entity has not been initialized.
    #[error("not found")]
    NotFound,

    /// The operation is not valid for the entity's current lifecycle state,
    /// or it was already performed.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Lifecycle conflict that names the state the entity is currently in.
    pub fn state_conflict(operation: &str, current: impl core::fmt::Debug) -> Self {
        Self::Conflict(format!("cannot {operation} while in state {current:?}"))
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
