use async_trait::async_trait;
use replicator_core::dead_letter::{
    AttemptRecord, DeadLetterEntry, DeadLetterReason, DeadLetterSink,
};
use replicator_core::error::ReplicationError;
use replicator_core::event::ChangeEvent;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use crate::schema::DEAD_LETTER_TABLE;
use crate::{corrupt_row, store_error};

/// Dead-letter sink backed by the `dead_letters` table.
///
/// Re-recording an event appends to its attempt history in place.
#[derive(Debug, Clone)]
pub struct PgDeadLetterSink {
    pool: PgPool,
}

impl PgDeadLetterSink {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn entry_from_row(row: &PgRow) -> Result<DeadLetterEntry, ReplicationError> {
    let Json(event) = row
        .try_get::<Json<ChangeEvent>, _>("event")
        .map_err(store_error)?;
    let Json(attempts) = row
        .try_get::<Json<Vec<AttemptRecord>>, _>("attempts")
        .map_err(store_error)?;
    let reason: String = row.try_get("reason").map_err(store_error)?;
    let reason = DeadLetterReason::parse(&reason)
        .ok_or_else(|| corrupt_row(DEAD_LETTER_TABLE, format!("unknown reason '{reason}'")))?;

    Ok(DeadLetterEntry {
        event,
        batch_id: row.try_get("batch_id").map_err(store_error)?,
        reason,
        attempts,
        recorded_at: row.try_get("recorded_at").map_err(store_error)?,
    })
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterSink {
    #[instrument(skip(self, entry), fields(event_id = %entry.event_id(), reason = %entry.reason))]
    async fn record(&self, entry: DeadLetterEntry) -> Result<(), ReplicationError> {
        sqlx::query(
            r"
            INSERT INTO dead_letters (event_id, batch_id, event, reason, attempts, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_id) DO UPDATE SET
                batch_id = EXCLUDED.batch_id,
                reason = EXCLUDED.reason,
                attempts = dead_letters.attempts || EXCLUDED.attempts
            ",
        )
        .bind(entry.event_id())
        .bind(entry.batch_id)
        .bind(Json(&entry.event))
        .bind(entry.reason.as_str())
        .bind(Json(&entry.attempts))
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn list(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DeadLetterEntry>, ReplicationError> {
        let rows = sqlx::query(
            r"
            SELECT event_id, batch_id, event, reason, attempts, recorded_at
            FROM dead_letters
            ORDER BY recorded_at, event_id
            OFFSET $1 LIMIT $2
            ",
        )
        .bind(to_i64(offset))
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<DeadLetterEntry>, ReplicationError> {
        let row = sqlx::query(
            r"
            SELECT event_id, batch_id, event, reason, attempts, recorded_at
            FROM dead_letters
            WHERE event_id = $1
            ",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn remove(&self, event_id: Uuid) -> Result<Option<DeadLetterEntry>, ReplicationError> {
        let row = sqlx::query(
            r"
            DELETE FROM dead_letters
            WHERE event_id = $1
            RETURNING event_id, batch_id, event, reason, attempts, recorded_at
            ",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn count(&self) -> Result<u64, ReplicationError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(u64::try_from(total).unwrap_or_default())
    }
}
