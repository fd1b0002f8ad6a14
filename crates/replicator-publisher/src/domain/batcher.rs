//! Envelope batcher: collects the change events of one owning-service
//! transaction and seals them into a transport batch.

use replicator_core::clock::Clock;
use replicator_core::error::ReplicationError;
use replicator_core::event::{Batch, ChangeEvent, EntityType, Process, Source};
use uuid::Uuid;

/// Accumulates events for one transaction of one owning service.
///
/// Events keep the order in which they were added. Every event must belong
/// to the batcher's source; the whole batch is validated again on seal.
#[derive(Debug)]
pub struct EnvelopeBatcher {
    source: Source,
    correlation_id: Uuid,
    events: Vec<ChangeEvent>,
}

impl EnvelopeBatcher {
    /// Starts an empty envelope for `source`.
    #[must_use]
    pub fn new(source: Source, correlation_id: Uuid) -> Self {
        Self {
            source,
            correlation_id,
            events: Vec::new(),
        }
    }

    /// The owning service of the envelope.
    #[must_use]
    pub fn source(&self) -> Source {
        self.source
    }

    /// Number of events collected so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if no event has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Adds a prepared event, stamping the envelope's correlation ID on it.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::InvalidBatch` if the event belongs to
    /// another source.
    pub fn push(&mut self, event: ChangeEvent) -> Result<&mut Self, ReplicationError> {
        if event.source != self.source {
            return Err(ReplicationError::InvalidBatch(format!(
                "event {} from {} cannot join a {} envelope",
                event.event_id, event.source, self.source
            )));
        }
        self.events
            .push(event.with_correlation_id(self.correlation_id));
        Ok(self)
    }

    /// Adds a change built from its parts.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::InvalidBatch` if the resulting event is not
    /// publishable.
    pub fn add(
        &mut self,
        process: Process,
        entity_type: EntityType,
        entity_key: impl Into<String>,
        version: i64,
        payload: Option<serde_json::Value>,
        clock: &dyn Clock,
    ) -> Result<&mut Self, ReplicationError> {
        let event = ChangeEvent::new(
            self.source,
            process,
            entity_type,
            entity_key.into(),
            version,
            payload,
            clock,
        );
        event.validate()?;
        self.push(event)
    }

    /// Seals the envelope into a batch.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::InvalidBatch` if the envelope is empty or
    /// any event is not publishable.
    pub fn seal(self, clock: &dyn Clock) -> Result<Batch, ReplicationError> {
        Batch::new(self.source, self.events, clock)
    }
}
