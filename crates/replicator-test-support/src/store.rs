//! Test replica stores — in-memory and failing `ReplicaStore` implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replicator_core::clock::{Clock, SystemClock};
use replicator_core::error::ReplicationError;
use replicator_core::ledger::{
    IdempotencyLedger, LedgerEntry, LedgerKey, ReplicaMutation, ReplicaRecord, ReplicaStore,
    VersionCheck,
};

#[derive(Debug, Default)]
struct StoreState {
    ledger: HashMap<LedgerKey, LedgerEntry>,
    records: HashMap<LedgerKey, ReplicaRecord>,
}

/// A replica store held in memory. The ledger check and the mutation happen
/// under one lock, which gives the same atomicity as a database transaction.
pub struct InMemoryReplicaStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    mutations: AtomicUsize,
}

impl std::fmt::Debug for InMemoryReplicaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryReplicaStore")
            .field("mutations", &self.mutations.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryReplicaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryReplicaStore {
    /// Creates an empty store stamped by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store stamped by `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            clock,
            mutations: AtomicUsize::new(0),
        }
    }

    /// Number of replica mutations actually performed.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Snapshot of every replica record, sorted by key.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn records(&self) -> Vec<ReplicaRecord> {
        let state = self.state.lock().unwrap();
        let mut records: Vec<ReplicaRecord> = state.records.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Number of ledger entries held.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn ledger_len(&self) -> usize {
        self.state.lock().unwrap().ledger.len()
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryReplicaStore {
    async fn entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>, ReplicationError> {
        Ok(self.state.lock().unwrap().ledger.get(key).cloned())
    }

    async fn purge_tombstones_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, ReplicationError> {
        let mut state = self.state.lock().unwrap();
        let expired: Vec<LedgerKey> = state
            .ledger
            .values()
            .filter(|entry| entry.deleted && entry.updated_at < cutoff)
            .map(|entry| entry.key.clone())
            .collect();
        for key in &expired {
            state.ledger.remove(key);
            state.records.remove(key);
        }
        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl ReplicaStore for InMemoryReplicaStore {
    async fn apply_versioned(
        &self,
        key: &LedgerKey,
        version: i64,
        mutation: ReplicaMutation,
    ) -> Result<VersionCheck, ReplicationError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        let check = VersionCheck::classify(state.ledger.get(key).map(|e| e.version), version);
        if !check.is_applied() {
            return Ok(check);
        }

        let deleted = mutation.is_delete();
        match mutation {
            ReplicaMutation::Upsert(data) => {
                state.records.insert(
                    key.clone(),
                    ReplicaRecord {
                        key: key.clone(),
                        data,
                        version,
                        updated_at: now,
                        deleted_at: None,
                    },
                );
            }
            ReplicaMutation::Remove => {
                state.records.remove(key);
            }
            ReplicaMutation::Tombstone => {
                let record = state
                    .records
                    .entry(key.clone())
                    .or_insert_with(|| ReplicaRecord {
                        key: key.clone(),
                        data: serde_json::Value::Null,
                        version,
                        updated_at: now,
                        deleted_at: None,
                    });
                record.version = version;
                record.updated_at = now;
                record.deleted_at = Some(now);
            }
        }
        state.ledger.insert(
            key.clone(),
            LedgerEntry {
                key: key.clone(),
                version,
                deleted,
                updated_at: now,
            },
        );
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(check)
    }

    async fn load_record(
        &self,
        key: &LedgerKey,
    ) -> Result<Option<ReplicaRecord>, ReplicationError> {
        Ok(self.state.lock().unwrap().records.get(key).cloned())
    }
}

/// A store that reports `StoreUnavailable` for the first `failures` writes,
/// then delegates to an in-memory store.
#[derive(Debug)]
pub struct FlakyReplicaStore {
    inner: InMemoryReplicaStore,
    failures_remaining: AtomicU32,
    write_calls: AtomicU32,
}

impl FlakyReplicaStore {
    /// Creates a store failing the first `failures` writes.
    #[must_use]
    pub fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryReplicaStore::new(),
            failures_remaining: AtomicU32::new(failures),
            write_calls: AtomicU32::new(0),
        }
    }

    /// The store receiving writes once the failures are used up.
    pub fn inner(&self) -> &InMemoryReplicaStore {
        &self.inner
    }

    /// Number of `apply_versioned` calls, failed ones included.
    pub fn write_calls(&self) -> u32 {
        self.write_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdempotencyLedger for FlakyReplicaStore {
    async fn entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>, ReplicationError> {
        self.inner.entry(key).await
    }

    async fn purge_tombstones_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, ReplicationError> {
        self.inner.purge_tombstones_before(cutoff).await
    }
}

#[async_trait]
impl ReplicaStore for FlakyReplicaStore {
    async fn apply_versioned(
        &self,
        key: &LedgerKey,
        version: i64,
        mutation: ReplicaMutation,
    ) -> Result<VersionCheck, ReplicationError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ReplicationError::StoreUnavailable(
                "connection refused".into(),
            ));
        }
        self.inner.apply_versioned(key, version, mutation).await
    }

    async fn load_record(
        &self,
        key: &LedgerKey,
    ) -> Result<Option<ReplicaRecord>, ReplicationError> {
        self.inner.load_record(key).await
    }
}

/// A store that always reports `StoreUnavailable`.
#[derive(Debug)]
pub struct FailingReplicaStore;

#[async_trait]
impl IdempotencyLedger for FailingReplicaStore {
    async fn entry(&self, _key: &LedgerKey) -> Result<Option<LedgerEntry>, ReplicationError> {
        Err(ReplicationError::StoreUnavailable("connection refused".into()))
    }

    async fn purge_tombstones_before(
        &self,
        _cutoff: DateTime<Utc>,
    ) -> Result<u64, ReplicationError> {
        Err(ReplicationError::StoreUnavailable("connection refused".into()))
    }
}

#[async_trait]
impl ReplicaStore for FailingReplicaStore {
    async fn apply_versioned(
        &self,
        _key: &LedgerKey,
        _version: i64,
        _mutation: ReplicaMutation,
    ) -> Result<VersionCheck, ReplicationError> {
        Err(ReplicationError::StoreUnavailable("connection refused".into()))
    }

    async fn load_record(
        &self,
        _key: &LedgerKey,
    ) -> Result<Option<ReplicaRecord>, ReplicationError> {
        Err(ReplicationError::StoreUnavailable("connection refused".into()))
    }
}
