//! Test version sequencer.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use replicator_core::error::ReplicationError;
use replicator_core::ledger::LedgerKey;
use replicator_core::versioning::VersionSequencer;

/// Per-key counters held in memory.
#[derive(Debug, Default)]
pub struct InMemoryVersionSequencer {
    counters: Mutex<HashMap<LedgerKey, i64>>,
}

impl InMemoryVersionSequencer {
    /// Creates a sequencer with no counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionSequencer for InMemoryVersionSequencer {
    async fn next_version(&self, key: &LedgerKey) -> Result<i64, ReplicationError> {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(key.clone()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}
