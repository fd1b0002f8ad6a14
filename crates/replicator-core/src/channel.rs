//! Replication channel abstraction.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ReplicationError;
use crate::event::Batch;

/// Confirmation that the channel durably accepted a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// The accepted batch.
    pub batch_id: Uuid,
    /// Partition the batch was routed to.
    pub partition: u32,
}

/// A batch handed to a consumer, awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The delivered batch.
    pub batch: Batch,
    /// Partition the batch was read from.
    pub partition: u32,
    /// How many times this batch has been delivered to this consumer,
    /// starting at 1.
    pub delivery_count: u32,
}

/// Transport connecting publishers to consumers.
///
/// Delivery is at-least-once per consumer group. Ordering holds only among
/// batches of the same partition; a rejected or unacknowledged batch is
/// redelivered before any later batch of its partition.
#[async_trait]
pub trait ReplicationChannel: Send + Sync {
    /// Number of partitions batches are spread over.
    fn partitions(&self) -> u32;

    /// Durably hands a batch to the channel.
    async fn send(&self, batch: &Batch) -> Result<Ack, ReplicationError>;

    /// Waits for the next batch of `partition`.
    async fn receive(&self, partition: u32) -> Result<Delivery, ReplicationError>;

    /// Marks a delivered batch as fully processed.
    async fn acknowledge(&self, batch_id: Uuid) -> Result<(), ReplicationError>;

    /// Returns a delivered batch to the channel for redelivery.
    async fn reject(&self, batch_id: Uuid, reason: &str) -> Result<(), ReplicationError>;

    /// How long a delivered batch stays reserved for this consumer, for
    /// transports whose reservations expire. `None` means they never do.
    fn lease(&self) -> Option<Duration> {
        None
    }

    /// Pushes back the expiry of the reservation on a delivered batch.
    ///
    /// Fails with `TransportFailure` once the reservation has passed to
    /// another consumer.
    async fn extend_lease(&self, _batch_id: Uuid) -> Result<(), ReplicationError> {
        Ok(())
    }
}
