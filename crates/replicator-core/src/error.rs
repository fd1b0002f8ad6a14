//! Replication error taxonomy.

use thiserror::Error;
use uuid::Uuid;

use crate::event::EntityType;

/// Top-level replication error type.
///
/// Stale and duplicate deliveries are not errors; they surface as
/// [`crate::ledger::ApplyOutcome`] values.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The channel could not accept or deliver a batch. Transient.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The event can never be applied as-is. Permanent.
    #[error("malformed event {event_id}: {reason}")]
    MalformedEvent {
        /// The offending event.
        event_id: Uuid,
        /// Why the event was rejected.
        reason: String,
    },

    /// No replica applier is registered for the entity type. Permanent.
    #[error("no replica applier registered for entity type {0}")]
    UnknownEntityType(EntityType),

    /// The replica store or ledger could not be reached. Transient.
    #[error("replica store unavailable: {0}")]
    StoreUnavailable(String),

    /// A batch failed validation before reaching the channel.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// No dead-letter entry exists for the event.
    #[error("dead-letter entry not found: {0}")]
    DeadLetterNotFound(Uuid),
}

impl ReplicationError {
    /// Builds a `MalformedEvent` error.
    pub fn malformed(event_id: Uuid, reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            event_id,
            reason: reason.into(),
        }
    }

    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportFailure(_) | Self::StoreUnavailable(_))
    }
}

/// Failure to parse one of the closed replication enums from text.
#[derive(Debug, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    /// The enum being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}
