//! Idempotency ledger and replica store abstractions.
//!
//! The ledger remembers the highest version applied per entity key. A replica
//! mutation and the ledger advance it belongs to always commit together, so a
//! crash can never leave one without the other.

use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReplicationError;
use crate::event::{EntityType, Source};

/// Identity of a replicated entity: `(source, entity_type, entity_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    /// The owning service.
    pub source: Source,
    /// Logical entity name.
    pub entity_type: EntityType,
    /// Stable identifier within `(source, entity_type)`.
    pub entity_key: String,
}

impl LedgerKey {
    /// Creates a new ledger key.
    #[must_use]
    pub fn new(source: Source, entity_type: EntityType, entity_key: impl Into<String>) -> Self {
        Self {
            source,
            entity_type,
            entity_key: entity_key.into(),
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.source, self.entity_type, self.entity_key)
    }
}

/// What an accepted event does to the replica record.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaMutation {
    /// Insert or fully replace the record with this document.
    Upsert(serde_json::Value),
    /// Delete the record.
    Remove,
    /// Keep the record but mark it deleted.
    Tombstone,
}

impl ReplicaMutation {
    /// Returns true if the mutation deletes the entity.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        !matches!(self, ReplicaMutation::Upsert(_))
    }
}

/// Result of comparing an incoming version against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    /// The version is newer; the mutation was (or may be) applied.
    Applied,
    /// The ledger already holds exactly this version.
    Duplicate {
        /// Version currently recorded.
        current: i64,
    },
    /// The ledger holds a newer version.
    Stale {
        /// Version currently recorded.
        current: i64,
    },
}

impl VersionCheck {
    /// Classifies `incoming` against the recorded version.
    #[must_use]
    pub fn classify(current: Option<i64>, incoming: i64) -> Self {
        match current {
            None => VersionCheck::Applied,
            Some(current) => match incoming.cmp(&current) {
                Ordering::Greater => VersionCheck::Applied,
                Ordering::Equal => VersionCheck::Duplicate { current },
                Ordering::Less => VersionCheck::Stale { current },
            },
        }
    }

    /// Returns true if the incoming version wins.
    #[must_use]
    pub fn is_applied(self) -> bool {
        matches!(self, VersionCheck::Applied)
    }
}

/// Outcome of applying one change event to a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The replica and ledger were advanced.
    Applied,
    /// A newer version was already applied; nothing changed.
    RejectedStale,
    /// This version was already applied; nothing changed.
    RejectedDuplicate,
}

impl From<VersionCheck> for ApplyOutcome {
    fn from(check: VersionCheck) -> Self {
        match check {
            VersionCheck::Applied => ApplyOutcome::Applied,
            VersionCheck::Duplicate { .. } => ApplyOutcome::RejectedDuplicate,
            VersionCheck::Stale { .. } => ApplyOutcome::RejectedStale,
        }
    }
}

/// The highest applied version of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The entity.
    pub key: LedgerKey,
    /// Highest applied version.
    pub version: i64,
    /// True if the highest applied version was a delete.
    pub deleted: bool,
    /// When the entry last advanced.
    pub updated_at: DateTime<Utc>,
}

/// Consumer-local denormalized copy of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    /// The entity.
    pub key: LedgerKey,
    /// Normalized replica document.
    pub data: serde_json::Value,
    /// Version that produced this state.
    pub version: i64,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
    /// Set when the record is a tombstone.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ReplicaRecord {
    /// Returns true if the record is a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Read side of the idempotency ledger, plus retention maintenance.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Loads the ledger entry for an entity.
    async fn entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>, ReplicationError>;

    /// Highest applied version for an entity, if any.
    async fn version(&self, key: &LedgerKey) -> Result<Option<i64>, ReplicationError> {
        Ok(self.entry(key).await?.map(|entry| entry.version))
    }

    /// Drops ledger entries (and tombstoned replicas) of entities deleted
    /// before `cutoff`. Returns the number of ledger entries removed.
    async fn purge_tombstones_before(&self, cutoff: DateTime<Utc>)
    -> Result<u64, ReplicationError>;
}

/// Replica storage whose every write is guarded by the idempotency ledger.
#[async_trait]
pub trait ReplicaStore: IdempotencyLedger {
    /// Atomically compares `version` with the ledger and, if newer, applies
    /// `mutation` and advances the ledger in the same local transaction.
    ///
    /// Stale and duplicate versions leave both replica and ledger untouched.
    async fn apply_versioned(
        &self,
        key: &LedgerKey,
        version: i64,
        mutation: ReplicaMutation,
    ) -> Result<VersionCheck, ReplicationError>;

    /// Loads the replica record of an entity.
    async fn load_record(&self, key: &LedgerKey)
    -> Result<Option<ReplicaRecord>, ReplicationError>;
}
