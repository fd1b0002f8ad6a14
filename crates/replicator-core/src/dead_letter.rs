//! Dead-letter sink abstraction.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ReplicationError;
use crate::event::ChangeEvent;

/// Why an event was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeadLetterReason {
    /// No applier is registered for the event's entity type.
    UnknownEntityType,
    /// The payload cannot be turned into a replica.
    MalformedEvent,
    /// Transient failures exceeded the retry budget.
    RetriesExhausted,
}

impl DeadLetterReason {
    /// Stable text form of the reason.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DeadLetterReason::UnknownEntityType => "unknown-entity-type",
            DeadLetterReason::MalformedEvent => "malformed-event",
            DeadLetterReason::RetriesExhausted => "retries-exhausted",
        }
    }

    /// Parses the text form produced by [`Self::as_str`].
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unknown-entity-type" => Some(DeadLetterReason::UnknownEntityType),
            "malformed-event" => Some(DeadLetterReason::MalformedEvent),
            "retries-exhausted" => Some(DeadLetterReason::RetriesExhausted),
            _ => None,
        }
    }

    /// Maps a permanent apply error to its reason.
    #[must_use]
    pub fn for_error(error: &ReplicationError) -> Self {
        match error {
            ReplicationError::UnknownEntityType(_) => DeadLetterReason::UnknownEntityType,
            ReplicationError::MalformedEvent { .. } | ReplicationError::InvalidBatch(_) => {
                DeadLetterReason::MalformedEvent
            }
            _ => DeadLetterReason::RetriesExhausted,
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed apply attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Error message of the failure.
    pub error: String,
    /// When the attempt failed.
    pub at: DateTime<Utc>,
}

/// A change event held for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The event that could not be applied.
    pub event: ChangeEvent,
    /// Batch the event was delivered in.
    pub batch_id: Uuid,
    /// Why it was dead-lettered.
    pub reason: DeadLetterReason,
    /// Failed attempts, oldest first.
    pub attempts: Vec<AttemptRecord>,
    /// When the entry was first recorded.
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// The event identifier; also the entry identifier.
    #[must_use]
    pub fn event_id(&self) -> Uuid {
        self.event.event_id
    }

    /// Number of failed attempts recorded.
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Error of the most recent attempt.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.attempts.last().map(|attempt| attempt.error.as_str())
    }

    /// Folds a re-recording of the same event into this entry: the reason
    /// is replaced and the new attempts are appended.
    pub fn merge(&mut self, newer: DeadLetterEntry) {
        self.reason = newer.reason;
        self.batch_id = newer.batch_id;
        self.attempts.extend(newer.attempts);
    }
}

/// Durable holding area for events that could not be applied.
///
/// Entries are keyed by event ID; recording an event that is already present
/// merges into the existing entry, so each event appears at most once.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Records (or merges) an entry.
    async fn record(&self, entry: DeadLetterEntry) -> Result<(), ReplicationError>;

    /// Lists entries oldest first.
    async fn list(&self, offset: u64, limit: u64)
    -> Result<Vec<DeadLetterEntry>, ReplicationError>;

    /// Loads one entry.
    async fn get(&self, event_id: Uuid) -> Result<Option<DeadLetterEntry>, ReplicationError>;

    /// Removes an entry, returning it if it existed.
    async fn remove(&self, event_id: Uuid) -> Result<Option<DeadLetterEntry>, ReplicationError>;

    /// Number of entries held.
    async fn count(&self) -> Result<u64, ReplicationError>;
}
