//! Query handlers for replica and ledger inspection.

use replicator_core::error::ReplicationError;
use replicator_core::ledger::{
    IdempotencyLedger, LedgerEntry, LedgerKey, ReplicaRecord, ReplicaStore,
};

/// Returns the ledger entry of an entity, if it was ever applied.
///
/// # Errors
///
/// Returns `ReplicationError::StoreUnavailable` if the ledger cannot be read.
pub async fn get_ledger_entry(
    key: &LedgerKey,
    ledger: &dyn IdempotencyLedger,
) -> Result<Option<LedgerEntry>, ReplicationError> {
    ledger.entry(key).await
}

/// Returns the replica record of an entity, tombstones included.
///
/// # Errors
///
/// Returns `ReplicationError::StoreUnavailable` if the store cannot be read.
pub async fn get_replica(
    key: &LedgerKey,
    store: &dyn ReplicaStore,
) -> Result<Option<ReplicaRecord>, ReplicationError> {
    store.load_record(key).await
}
