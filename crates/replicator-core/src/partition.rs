//! Partition assignment.
//!
//! All mutations of one entity hash to the same partition, so they are
//! delivered in order relative to each other.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::event::EntityType;

/// The entity whose mutations must serialize through one partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    /// Entity type of the batch's first event.
    pub entity_type: EntityType,
    /// Entity key of the batch's first event.
    pub entity_key: String,
}

impl PartitionKey {
    /// Creates a new partition key.
    #[must_use]
    pub fn new(entity_type: EntityType, entity_key: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_key: entity_key.into(),
        }
    }

    /// Stable partition index in `[0, partitions)`.
    ///
    /// Uses SHA-256 so the assignment does not change between builds or
    /// processes. `partitions == 0` is treated as a single partition.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn partition(&self, partitions: u32) -> u32 {
        let partitions = u64::from(partitions.max(1));
        let mut hasher = Sha256::new();
        hasher.update(self.entity_type.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(self.entity_key.as_bytes());
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % partitions) as u32
    }
}
