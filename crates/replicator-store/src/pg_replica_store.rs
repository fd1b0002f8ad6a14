//! `PostgreSQL` implementation of `ReplicaStore` and `IdempotencyLedger`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replicator_core::clock::{Clock, SystemClock};
use replicator_core::error::ReplicationError;
use replicator_core::ledger::{
    IdempotencyLedger, LedgerEntry, LedgerKey, ReplicaMutation, ReplicaRecord, ReplicaStore,
    VersionCheck,
};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::store_error;

/// Replica store whose ledger compare-and-set and replica mutation share one
/// database transaction.
#[derive(Clone)]
pub struct PgReplicaStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PgReplicaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgReplicaStore").finish_non_exhaustive()
    }
}

impl PgReplicaStore {
    /// Creates a store stamped by the system clock.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    /// Creates a store stamped by `clock`.
    #[must_use]
    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    async fn mutate(
        tx: &mut Transaction<'_, Postgres>,
        key: &LedgerKey,
        version: i64,
        mutation: ReplicaMutation,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        match mutation {
            ReplicaMutation::Upsert(data) => {
                sqlx::query(
                    r"
                    INSERT INTO replica_records
                        (source, entity_type, entity_key, data, version, updated_at, deleted_at)
                    VALUES ($1, $2, $3, $4, $5, $6, NULL)
                    ON CONFLICT (source, entity_type, entity_key) DO UPDATE SET
                        data = EXCLUDED.data,
                        version = EXCLUDED.version,
                        updated_at = EXCLUDED.updated_at,
                        deleted_at = NULL
                    ",
                )
                .bind(key.source.as_str())
                .bind(key.entity_type.as_str())
                .bind(&key.entity_key)
                .bind(Json(data))
                .bind(version)
                .bind(now)
                .execute(&mut **tx)
                .await?;
            }
            ReplicaMutation::Remove => {
                sqlx::query(
                    r"
                    DELETE FROM replica_records
                    WHERE source = $1 AND entity_type = $2 AND entity_key = $3
                    ",
                )
                .bind(key.source.as_str())
                .bind(key.entity_type.as_str())
                .bind(&key.entity_key)
                .execute(&mut **tx)
                .await?;
            }
            ReplicaMutation::Tombstone => {
                sqlx::query(
                    r"
                    INSERT INTO replica_records
                        (source, entity_type, entity_key, data, version, updated_at, deleted_at)
                    VALUES ($1, $2, $3, 'null'::jsonb, $4, $5, $5)
                    ON CONFLICT (source, entity_type, entity_key) DO UPDATE SET
                        version = EXCLUDED.version,
                        updated_at = EXCLUDED.updated_at,
                        deleted_at = EXCLUDED.deleted_at
                    ",
                )
                .bind(key.source.as_str())
                .bind(key.entity_type.as_str())
                .bind(&key.entity_key)
                .bind(version)
                .bind(now)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyLedger for PgReplicaStore {
    async fn entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>, ReplicationError> {
        let row = sqlx::query(
            r"
            SELECT version, deleted, updated_at
            FROM replication_ledger
            WHERE source = $1 AND entity_type = $2 AND entity_key = $3
            ",
        )
        .bind(key.source.as_str())
        .bind(key.entity_type.as_str())
        .bind(&key.entity_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(|row| {
            Ok(LedgerEntry {
                key: key.clone(),
                version: row.try_get("version")?,
                deleted: row.try_get("deleted")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
        .map_err(store_error)
    }

    async fn purge_tombstones_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, ReplicationError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        sqlx::query(
            r"
            DELETE FROM replica_records r
            USING replication_ledger l
            WHERE l.source = r.source
              AND l.entity_type = r.entity_type
              AND l.entity_key = r.entity_key
              AND l.deleted
              AND l.updated_at < $1
            ",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        let purged = sqlx::query(
            r"
            DELETE FROM replication_ledger
            WHERE deleted AND updated_at < $1
            ",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?
        .rows_affected();

        tx.commit().await.map_err(store_error)?;
        Ok(purged)
    }
}

#[async_trait]
impl ReplicaStore for PgReplicaStore {
    async fn apply_versioned(
        &self,
        key: &LedgerKey,
        version: i64,
        mutation: ReplicaMutation,
    ) -> Result<VersionCheck, ReplicationError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        // Advances the ledger only when the incoming version is newer. The
        // conflicting row stays locked until the transaction ends.
        let advanced: Option<i64> = sqlx::query_scalar(
            r"
            INSERT INTO replication_ledger
                (source, entity_type, entity_key, version, deleted, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source, entity_type, entity_key) DO UPDATE SET
                version = EXCLUDED.version,
                deleted = EXCLUDED.deleted,
                updated_at = EXCLUDED.updated_at
            WHERE replication_ledger.version < EXCLUDED.version
            RETURNING version
            ",
        )
        .bind(key.source.as_str())
        .bind(key.entity_type.as_str())
        .bind(&key.entity_key)
        .bind(version)
        .bind(mutation.is_delete())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;

        if advanced.is_none() {
            let current: i64 = sqlx::query_scalar(
                r"
                SELECT version FROM replication_ledger
                WHERE source = $1 AND entity_type = $2 AND entity_key = $3
                ",
            )
            .bind(key.source.as_str())
            .bind(key.entity_type.as_str())
            .bind(&key.entity_key)
            .fetch_one(&mut *tx)
            .await
            .map_err(store_error)?;
            tx.rollback().await.map_err(store_error)?;

            let check = VersionCheck::classify(Some(current), version);
            debug!(%key, version, current, "ledger rejected version");
            return Ok(check);
        }

        Self::mutate(&mut tx, key, version, mutation, now)
            .await
            .map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;
        Ok(VersionCheck::Applied)
    }

    async fn load_record(
        &self,
        key: &LedgerKey,
    ) -> Result<Option<ReplicaRecord>, ReplicationError> {
        let row = sqlx::query(
            r"
            SELECT data, version, updated_at, deleted_at
            FROM replica_records
            WHERE source = $1 AND entity_type = $2 AND entity_key = $3
            ",
        )
        .bind(key.source.as_str())
        .bind(key.entity_type.as_str())
        .bind(&key.entity_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(|row| {
            let Json(data) = row.try_get::<Json<serde_json::Value>, _>("data")?;
            Ok(ReplicaRecord {
                key: key.clone(),
                data,
                version: row.try_get("version")?,
                updated_at: row.try_get("updated_at")?,
                deleted_at: row.try_get("deleted_at")?,
            })
        })
        .transpose()
        .map_err(store_error)
    }
}
