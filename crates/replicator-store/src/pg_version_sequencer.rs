use async_trait::async_trait;
use replicator_core::error::ReplicationError;
use replicator_core::ledger::LedgerKey;
use replicator_core::versioning::VersionSequencer;
use sqlx::PgPool;

use crate::store_error;

/// Per-entity version counters in `replication_versions`.
///
/// The increment is a single upsert, so concurrent producers of the same
/// entity always receive distinct versions.
#[derive(Debug, Clone)]
pub struct PgVersionSequencer {
    pool: PgPool,
}

impl PgVersionSequencer {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VersionSequencer for PgVersionSequencer {
    async fn next_version(&self, key: &LedgerKey) -> Result<i64, ReplicationError> {
        sqlx::query_scalar(
            r"
            INSERT INTO replication_versions (source, entity_type, entity_key, version)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (source, entity_type, entity_key) DO UPDATE SET
                version = replication_versions.version + 1
            RETURNING version
            ",
        )
        .bind(key.source.as_str())
        .bind(key.entity_type.as_str())
        .bind(&key.entity_key)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)
    }
}
