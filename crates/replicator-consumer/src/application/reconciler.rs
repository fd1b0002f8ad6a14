//! Dead-letter reconciliation for operators.

use std::sync::Arc;

use replicator_core::clock::{Clock, SystemClock};
use replicator_core::dead_letter::{
    AttemptRecord, DeadLetterEntry, DeadLetterReason, DeadLetterSink,
};
use replicator_core::error::ReplicationError;
use replicator_core::ledger::ApplyOutcome;
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::application::registry::ApplierRegistry;

/// One page of dead-letter entries.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterPage {
    pub entries: Vec<DeadLetterEntry>,
    /// Number of entries in the sink, across all pages.
    pub total: u64,
}

/// Result of reprocessing a dead-lettered event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReprocessOutcome {
    /// The applier reached a verdict; the entry was removed.
    Resolved { outcome: ApplyOutcome },
    /// The event failed again; the attempt was appended to the entry.
    StillFailing {
        reason: DeadLetterReason,
        error: String,
    },
}

/// Operator interface over the dead-letter sink.
pub struct Reconciler {
    sink: Arc<dyn DeadLetterSink>,
    registry: Arc<ApplierRegistry>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(sink: Arc<dyn DeadLetterSink>, registry: Arc<ApplierRegistry>) -> Self {
        Self {
            sink,
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock stamping new attempts.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Lists entries oldest first.
    ///
    /// # Errors
    ///
    /// Returns the sink's error if it cannot be read.
    pub async fn list(&self, offset: u64, limit: u64) -> Result<DeadLetterPage, ReplicationError> {
        let entries = self.sink.list(offset, limit).await?;
        let total = self.sink.count().await?;
        Ok(DeadLetterPage { entries, total })
    }

    /// Loads one entry.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::DeadLetterNotFound` if no entry exists.
    pub async fn get(&self, event_id: Uuid) -> Result<DeadLetterEntry, ReplicationError> {
        self.sink
            .get(event_id)
            .await?
            .ok_or(ReplicationError::DeadLetterNotFound(event_id))
    }

    /// Sends the entry's event through its applier again.
    ///
    /// Any verdict, including stale or duplicate, resolves the entry. A
    /// further failure is appended to the entry's attempt history.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::DeadLetterNotFound` if no entry exists, or
    /// the sink's error if the entry cannot be updated.
    #[instrument(skip(self))]
    pub async fn reprocess(&self, event_id: Uuid) -> Result<ReprocessOutcome, ReplicationError> {
        let entry = self.get(event_id).await?;
        let result = match self.registry.get(entry.event.entity_type) {
            Some(applier) => applier.apply(&entry.event).await,
            None => Err(ReplicationError::UnknownEntityType(entry.event.entity_type)),
        };

        match result {
            Ok(outcome) => {
                self.sink.remove(event_id).await?;
                info!(?outcome, "dead-letter entry resolved");
                Ok(ReprocessOutcome::Resolved { outcome })
            }
            Err(err) => {
                let reason = if err.is_retryable() {
                    DeadLetterReason::RetriesExhausted
                } else {
                    DeadLetterReason::for_error(&err)
                };
                let attempt = AttemptRecord {
                    attempt: u32::try_from(entry.attempt_count() + 1).unwrap_or(u32::MAX),
                    error: err.to_string(),
                    at: self.clock.now(),
                };
                self.sink
                    .record(DeadLetterEntry {
                        event: entry.event,
                        batch_id: entry.batch_id,
                        reason,
                        attempts: vec![attempt],
                        recorded_at: entry.recorded_at,
                    })
                    .await?;
                warn!(%reason, error = %err, "reprocess failed");
                Ok(ReprocessOutcome::StillFailing {
                    reason,
                    error: err.to_string(),
                })
            }
        }
    }

    /// Drops an entry without applying it.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::DeadLetterNotFound` if no entry exists.
    #[instrument(skip(self))]
    pub async fn discard(&self, event_id: Uuid) -> Result<DeadLetterEntry, ReplicationError> {
        let entry = self
            .sink
            .remove(event_id)
            .await?
            .ok_or(ReplicationError::DeadLetterNotFound(event_id))?;
        info!(
            entity_type = %entry.event.entity_type,
            entity_key = %entry.event.entity_key,
            version = entry.event.version,
            "dead-letter entry discarded"
        );
        Ok(entry)
    }
}
