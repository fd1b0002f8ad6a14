//! Durable replication channel over `PostgreSQL`.
//!
//! Batches are appended to `replication_batches`; each consumer group keeps a
//! cursor per partition in `replication_cursors`. A cursor holds at most one
//! in-flight batch under a time-bounded lease: an unacknowledged batch is
//! redelivered once its lease expires, and a rejected one immediately.
//! Appends to one partition are serialized, so a cursor never moves past a
//! batch that has yet to commit.
//!
//! Log entries a consumer cannot decode, such as events of an entity type it
//! does not know yet, are moved to `replication_quarantine` for that group
//! and the rest of the batch is delivered.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replicator_core::channel::{Ack, Delivery, ReplicationChannel};
use replicator_core::error::ReplicationError;
use replicator_core::event::{Batch, ChangeEvent, Source};
use serde::Deserialize;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

/// Advisory lock class taken, together with the partition, by every append.
pub const LOG_APPEND_LOCK: i32 = 0x5250_4C47;

/// `event_index` recorded when a whole batch envelope is unreadable.
const WHOLE_BATCH: i32 = -1;

/// Partitioned channel backed by a replication log table.
#[derive(Debug, Clone)]
pub struct PgChannel {
    pool: PgPool,
    group: String,
    partitions: u32,
    owner: Uuid,
    lease: Duration,
    poll_interval: Duration,
}

fn transport_error(err: sqlx::Error) -> ReplicationError {
    ReplicationError::TransportFailure(err.to_string())
}

impl PgChannel {
    /// Creates a channel reading as consumer group `group`.
    #[must_use]
    pub fn new(pool: PgPool, group: impl Into<String>, partitions: u32) -> Self {
        Self {
            pool,
            group: group.into(),
            partitions: partitions.max(1),
            owner: Uuid::now_v7(),
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// How long a delivered batch stays reserved for this consumer.
    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Pause between polls of an empty partition.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Identifier this instance holds leases under.
    #[must_use]
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    fn partition_column(&self, partition: u32) -> Result<i32, ReplicationError> {
        if partition >= self.partitions {
            return Err(ReplicationError::TransportFailure(format!(
                "partition {partition} does not exist (channel has {})",
                self.partitions
            )));
        }
        i32::try_from(partition).map_err(|_| {
            ReplicationError::TransportFailure(format!("partition {partition} out of range"))
        })
    }

    /// Reserves the next deliverable batch of a partition, if any.
    async fn try_claim(&self, partition: u32) -> Result<Option<Delivery>, ReplicationError> {
        let column = self.partition_column(partition)?;
        let mut tx = self.pool.begin().await.map_err(transport_error)?;

        sqlx::query(
            r"
            INSERT INTO replication_cursors (consumer_group, partition)
            VALUES ($1, $2)
            ON CONFLICT (consumer_group, partition) DO NOTHING
            ",
        )
        .bind(&self.group)
        .bind(column)
        .execute(&mut *tx)
        .await
        .map_err(transport_error)?;

        let cursor = sqlx::query(
            r"
            SELECT acked_seq,
                   in_flight_seq,
                   delivery_count,
                   COALESCE(leased_until > NOW(), FALSE) AS leased
            FROM replication_cursors
            WHERE consumer_group = $1 AND partition = $2
            FOR UPDATE
            ",
        )
        .bind(&self.group)
        .bind(column)
        .fetch_one(&mut *tx)
        .await
        .map_err(transport_error)?;

        let leased: bool = cursor.try_get("leased").map_err(transport_error)?;
        if leased {
            tx.commit().await.map_err(transport_error)?;
            return Ok(None);
        }
        let acked_seq: i64 = cursor.try_get("acked_seq").map_err(transport_error)?;
        let in_flight_seq: Option<i64> = cursor.try_get("in_flight_seq").map_err(transport_error)?;
        let delivery_count: i32 = cursor.try_get("delivery_count").map_err(transport_error)?;

        let (mut candidate, mut delivery_count) = match in_flight_seq {
            Some(seq) => (logged_at(&mut tx, seq).await?, delivery_count.saturating_add(1)),
            None => (logged_after(&mut tx, column, acked_seq).await?, 1),
        };

        loop {
            let Some(logged) = candidate else {
                tx.commit().await.map_err(transport_error)?;
                return Ok(None);
            };
            let (readable, unreadable) = decode_logged(&logged.batch);
            if !unreadable.is_empty() {
                self.quarantine(&mut tx, &logged, &unreadable).await?;
            }

            let Some(batch) = readable else {
                self.skip(&mut tx, column, logged.seq).await?;
                candidate = logged_after(&mut tx, column, logged.seq).await?;
                delivery_count = 1;
                continue;
            };

            sqlx::query(
                r"
                UPDATE replication_cursors SET
                    in_flight_seq = $3,
                    delivery_count = $4,
                    lease_owner = $5,
                    leased_until = NOW() + make_interval(secs => $6)
                WHERE consumer_group = $1 AND partition = $2
                ",
            )
            .bind(&self.group)
            .bind(column)
            .bind(logged.seq)
            .bind(delivery_count)
            .bind(self.owner)
            .bind(self.lease.as_secs_f64())
            .execute(&mut *tx)
            .await
            .map_err(transport_error)?;
            tx.commit().await.map_err(transport_error)?;

            debug!(
                batch_id = %batch.batch_id,
                partition,
                seq = logged.seq,
                delivery_count,
                "batch leased"
            );
            return Ok(Some(Delivery {
                batch,
                partition,
                delivery_count: u32::try_from(delivery_count).unwrap_or(u32::MAX),
            }));
        }
    }

    /// Sets aside the parts of a logged batch this consumer cannot decode.
    async fn quarantine(
        &self,
        conn: &mut PgConnection,
        logged: &LoggedBatch,
        unreadable: &[Unreadable],
    ) -> Result<(), ReplicationError> {
        for item in unreadable {
            let event_index = item
                .event_index
                .and_then(|index| i32::try_from(index).ok())
                .unwrap_or(WHOLE_BATCH);
            sqlx::query(
                r"
                INSERT INTO replication_quarantine
                    (consumer_group, seq, event_index, batch_id, payload, error)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (consumer_group, seq, event_index) DO NOTHING
                ",
            )
            .bind(&self.group)
            .bind(logged.seq)
            .bind(event_index)
            .bind(logged.batch_id)
            .bind(Json(&item.payload))
            .bind(&item.error)
            .execute(&mut *conn)
            .await
            .map_err(transport_error)?;
            error!(
                batch_id = %logged.batch_id,
                seq = logged.seq,
                event_index,
                error = %item.error,
                "unreadable log entry quarantined"
            );
        }
        Ok(())
    }

    /// Moves the cursor past a log entry with nothing left to deliver.
    async fn skip(
        &self,
        conn: &mut PgConnection,
        column: i32,
        seq: i64,
    ) -> Result<(), ReplicationError> {
        sqlx::query(
            r"
            UPDATE replication_cursors SET
                acked_seq = $3,
                in_flight_seq = NULL,
                delivery_count = 0,
                lease_owner = NULL,
                leased_until = NULL
            WHERE consumer_group = $1 AND partition = $2
            ",
        )
        .bind(&self.group)
        .bind(column)
        .bind(seq)
        .execute(&mut *conn)
        .await
        .map_err(transport_error)?;
        Ok(())
    }

    /// Log entries this consumer group has quarantined, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::TransportFailure` if the quarantine cannot
    /// be read.
    pub async fn quarantined(&self) -> Result<Vec<QuarantinedEntry>, ReplicationError> {
        let rows = sqlx::query(
            r"
            SELECT seq, event_index, batch_id, payload, error, recorded_at
            FROM replication_quarantine
            WHERE consumer_group = $1
            ORDER BY seq, event_index
            ",
        )
        .bind(&self.group)
        .fetch_all(&self.pool)
        .await
        .map_err(transport_error)?;

        rows.iter().map(QuarantinedEntry::from_row).collect()
    }

    /// Deletes batches every consumer group has acknowledged. Returns the
    /// number of batches removed.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::TransportFailure` if the log cannot be
    /// pruned.
    pub async fn prune_delivered(&self) -> Result<u64, ReplicationError> {
        let pruned = sqlx::query(
            r"
            DELETE FROM replication_batches b
            WHERE b.seq <= (
                SELECT MIN(c.acked_seq) FROM replication_cursors c
                WHERE c.partition = b.partition
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(transport_error)?
        .rows_affected();
        Ok(pruned)
    }
}

#[async_trait]
impl ReplicationChannel for PgChannel {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    #[instrument(skip(self, batch), fields(batch_id = %batch.batch_id))]
    async fn send(&self, batch: &Batch) -> Result<Ack, ReplicationError> {
        let key = batch.partition_key().ok_or_else(|| {
            ReplicationError::InvalidBatch(format!("batch {} contains no events", batch.batch_id))
        })?;
        let partition = key.partition(self.partitions);
        let column = self.partition_column(partition)?;
        let mut tx = self.pool.begin().await.map_err(transport_error)?;

        // Held until commit: the sequence number is drawn under the lock, so
        // a partition's batches become visible in sequence order.
        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(LOG_APPEND_LOCK)
            .bind(column)
            .execute(&mut *tx)
            .await
            .map_err(transport_error)?;
        sqlx::query(
            r"
            INSERT INTO replication_batches (batch_id, partition, batch)
            VALUES ($1, $2, $3)
            ",
        )
        .bind(batch.batch_id)
        .bind(column)
        .bind(Json(batch))
        .execute(&mut *tx)
        .await
        .map_err(transport_error)?;
        tx.commit().await.map_err(transport_error)?;

        debug!(partition, events = batch.len(), "batch appended to log");
        Ok(Ack {
            batch_id: batch.batch_id,
            partition,
        })
    }

    async fn receive(&self, partition: u32) -> Result<Delivery, ReplicationError> {
        loop {
            if let Some(delivery) = self.try_claim(partition).await? {
                return Ok(delivery);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn acknowledge(&self, batch_id: Uuid) -> Result<(), ReplicationError> {
        let updated = sqlx::query(
            r"
            UPDATE replication_cursors c SET
                acked_seq = c.in_flight_seq,
                in_flight_seq = NULL,
                delivery_count = 0,
                lease_owner = NULL,
                leased_until = NULL
            FROM replication_batches b
            WHERE c.consumer_group = $1
              AND c.lease_owner = $2
              AND b.seq = c.in_flight_seq
              AND b.batch_id = $3
            ",
        )
        .bind(&self.group)
        .bind(self.owner)
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(transport_error)?
        .rows_affected();

        if updated == 0 {
            return Err(ReplicationError::TransportFailure(format!(
                "batch {batch_id} is not in flight for this consumer"
            )));
        }
        debug!(%batch_id, "batch acknowledged");
        Ok(())
    }

    async fn reject(&self, batch_id: Uuid, reason: &str) -> Result<(), ReplicationError> {
        let updated = sqlx::query(
            r"
            UPDATE replication_cursors c SET
                lease_owner = NULL,
                leased_until = NULL
            FROM replication_batches b
            WHERE c.consumer_group = $1
              AND c.lease_owner = $2
              AND b.seq = c.in_flight_seq
              AND b.batch_id = $3
            ",
        )
        .bind(&self.group)
        .bind(self.owner)
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(transport_error)?
        .rows_affected();

        if updated == 0 {
            return Err(ReplicationError::TransportFailure(format!(
                "batch {batch_id} is not in flight for this consumer"
            )));
        }
        warn!(%batch_id, reason, "batch rejected, released for redelivery");
        Ok(())
    }

    fn lease(&self) -> Option<Duration> {
        Some(self.lease)
    }

    async fn extend_lease(&self, batch_id: Uuid) -> Result<(), ReplicationError> {
        let updated = sqlx::query(
            r"
            UPDATE replication_cursors c SET
                leased_until = NOW() + make_interval(secs => $4)
            FROM replication_batches b
            WHERE c.consumer_group = $1
              AND c.lease_owner = $2
              AND b.seq = c.in_flight_seq
              AND b.batch_id = $3
            ",
        )
        .bind(&self.group)
        .bind(self.owner)
        .bind(batch_id)
        .bind(self.lease.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(transport_error)?
        .rows_affected();

        if updated == 0 {
            return Err(ReplicationError::TransportFailure(format!(
                "lease on batch {batch_id} is no longer held by this consumer"
            )));
        }
        Ok(())
    }
}

/// A row of the replication log.
struct LoggedBatch {
    seq: i64,
    batch_id: Uuid,
    batch: serde_json::Value,
}

impl LoggedBatch {
    fn from_row(row: &PgRow) -> Result<Self, ReplicationError> {
        Ok(Self {
            seq: row.try_get("seq").map_err(transport_error)?,
            batch_id: row.try_get("batch_id").map_err(transport_error)?,
            batch: row.try_get("batch").map_err(transport_error)?,
        })
    }
}

async fn logged_at(
    conn: &mut PgConnection,
    seq: i64,
) -> Result<Option<LoggedBatch>, ReplicationError> {
    sqlx::query("SELECT seq, batch_id, batch FROM replication_batches WHERE seq = $1")
        .bind(seq)
        .fetch_optional(&mut *conn)
        .await
        .map_err(transport_error)?
        .as_ref()
        .map(LoggedBatch::from_row)
        .transpose()
}

async fn logged_after(
    conn: &mut PgConnection,
    partition: i32,
    after: i64,
) -> Result<Option<LoggedBatch>, ReplicationError> {
    sqlx::query(
        r"
        SELECT seq, batch_id, batch FROM replication_batches
        WHERE partition = $1 AND seq > $2
        ORDER BY seq
        LIMIT 1
        ",
    )
    .bind(partition)
    .bind(after)
    .fetch_optional(&mut *conn)
    .await
    .map_err(transport_error)?
    .as_ref()
    .map(LoggedBatch::from_row)
    .transpose()
}

/// Batch fields with the events left undecoded.
#[derive(Deserialize)]
struct Envelope {
    batch_id: Uuid,
    source: Source,
    events: Vec<serde_json::Value>,
    created_at: DateTime<Utc>,
}

/// Part of a logged batch that does not decode.
#[derive(Debug)]
struct Unreadable {
    /// Position in the batch; `None` for the envelope itself.
    event_index: Option<usize>,
    payload: serde_json::Value,
    error: String,
}

/// Splits a logged batch into the batch of events that decode, if any, and
/// the parts that do not.
fn decode_logged(raw: &serde_json::Value) -> (Option<Batch>, Vec<Unreadable>) {
    let envelope = match Envelope::deserialize(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            let unreadable = Unreadable {
                event_index: None,
                payload: raw.clone(),
                error: err.to_string(),
            };
            return (None, vec![unreadable]);
        }
    };

    let mut events = Vec::with_capacity(envelope.events.len());
    let mut unreadable = Vec::new();
    for (index, event) in envelope.events.into_iter().enumerate() {
        match ChangeEvent::deserialize(&event) {
            Ok(decoded) => events.push(decoded),
            Err(err) => unreadable.push(Unreadable {
                event_index: Some(index),
                payload: event,
                error: err.to_string(),
            }),
        }
    }

    let batch = (!events.is_empty()).then(|| Batch {
        batch_id: envelope.batch_id,
        source: envelope.source,
        events,
        created_at: envelope.created_at,
    });
    (batch, unreadable)
}

/// A log entry a consumer group set aside as unreadable.
#[derive(Debug, Clone, PartialEq)]
pub struct QuarantinedEntry {
    /// Log position of the batch.
    pub seq: i64,
    pub batch_id: Uuid,
    /// Position of the event in its batch; `None` when the whole batch was
    /// unreadable.
    pub event_index: Option<u32>,
    /// The undecoded event, or the whole batch.
    pub payload: serde_json::Value,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

impl QuarantinedEntry {
    fn from_row(row: &PgRow) -> Result<Self, ReplicationError> {
        let event_index: i32 = row.try_get("event_index").map_err(transport_error)?;
        Ok(Self {
            seq: row.try_get("seq").map_err(transport_error)?,
            batch_id: row.try_get("batch_id").map_err(transport_error)?,
            event_index: u32::try_from(event_index).ok(),
            payload: row.try_get("payload").map_err(transport_error)?,
            error: row.try_get("error").map_err(transport_error)?,
            recorded_at: row.try_get("recorded_at").map_err(transport_error)?,
        })
    }
}
