//! The routing error taxonomy.
//!
//! Every fallible operation in the contract returns one of these kinds.
//! The gateway maps kinds to HTTP statuses and serializes them as
//! `{"name": ..., "message": ...}`, so the kind names are part of the wire
//! format and must stay stable.

use thiserror::Error;

/// Result type for routing operations.
pub type RoutingResult<T> = Result<T, RoutingError>;

/// Errors produced by the storage contract, the event hub, and watches.
#[derive(Debug, Clone, Error)]
pub enum RoutingError {
    /// Entity failed validation. No side effects occurred.
    #[error("{0}")]
    Invalid(String),

    /// Lookup by identity found nothing.
    #[error("{0}")]
    NotFound(String),

    /// A uniqueness constraint fired under a concurrent race.
    #[error("{0}")]
    Conflict(String),

    /// A TCP route references an unknown router group or a port outside
    /// its reservable range.
    #[error("{0}")]
    RefIntegrity(String),

    /// A router-group change would orphan currently-mapped routes.
    #[error("{0}")]
    InUse(String),

    /// The back-end store failed.
    #[error("backend failure: {0}")]
    Backend(String),

    /// A subscriber fell behind and its buffer filled; the subscription
    /// is dead and must be re-established.
    #[error("event subscription overflowed and was closed")]
    Overflow,

    /// The subscription was closed normally.
    #[error("event subscription closed")]
    Closed,

    /// An unknown watch family was requested.
    #[error("invalid watch family: {0}")]
    InvalidFamily(String),
}

impl RoutingError {
    /// The stable kind name used in error response bodies.
    pub fn name(&self) -> &'static str {
        match self {
            RoutingError::Invalid(_) => "Invalid",
            RoutingError::NotFound(_) => "NotFound",
            RoutingError::Conflict(_) => "Conflict",
            RoutingError::RefIntegrity(_) => "RefIntegrity",
            RoutingError::InUse(_) => "InUse",
            RoutingError::Backend(_) => "Backend",
            RoutingError::Overflow => "Overflow",
            RoutingError::Closed => "Closed",
            RoutingError::InvalidFamily(_) => "InvalidFamily",
        }
    }

    /// Shorthand for a backend fault wrapping another error.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        RoutingError::Backend(err.to_string())
    }
}
