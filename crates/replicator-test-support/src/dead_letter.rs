//! Test dead-letter sinks — in-memory and failing `DeadLetterSink`
//! implementations.

use std::sync::Mutex;

use async_trait::async_trait;
use replicator_core::dead_letter::{DeadLetterEntry, DeadLetterSink};
use replicator_core::error::ReplicationError;
use uuid::Uuid;

/// A dead-letter sink held in memory, in recording order.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn record(&self, entry: DeadLetterEntry) -> Result<(), ReplicationError> {
        let mut entries = self.entries.lock().unwrap();
        match entries
            .iter_mut()
            .find(|existing| existing.event_id() == entry.event_id())
        {
            Some(existing) => existing.merge(entry),
            None => entries.push(entry),
        }
        Ok(())
    }

    async fn list(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DeadLetterEntry>, ReplicationError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<DeadLetterEntry>, ReplicationError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.iter().find(|e| e.event_id() == event_id).cloned())
    }

    async fn remove(&self, event_id: Uuid) -> Result<Option<DeadLetterEntry>, ReplicationError> {
        let mut entries = self.entries.lock().unwrap();
        let position = entries.iter().position(|e| e.event_id() == event_id);
        Ok(position.map(|index| entries.remove(index)))
    }

    async fn count(&self) -> Result<u64, ReplicationError> {
        Ok(self.entries.lock().unwrap().len() as u64)
    }
}

/// A sink that always reports `StoreUnavailable`.
#[derive(Debug)]
pub struct FailingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for FailingDeadLetterSink {
    async fn record(&self, _entry: DeadLetterEntry) -> Result<(), ReplicationError> {
        Err(ReplicationError::StoreUnavailable("connection refused".into()))
    }

    async fn list(
        &self,
        _offset: u64,
        _limit: u64,
    ) -> Result<Vec<DeadLetterEntry>, ReplicationError> {
        Err(ReplicationError::StoreUnavailable("connection refused".into()))
    }

    async fn get(&self, _event_id: Uuid) -> Result<Option<DeadLetterEntry>, ReplicationError> {
        Err(ReplicationError::StoreUnavailable("connection refused".into()))
    }

    async fn remove(&self, _event_id: Uuid) -> Result<Option<DeadLetterEntry>, ReplicationError> {
        Err(ReplicationError::StoreUnavailable("connection refused".into()))
    }

    async fn count(&self) -> Result<u64, ReplicationError> {
        Err(ReplicationError::StoreUnavailable("connection refused".into()))
    }
}
