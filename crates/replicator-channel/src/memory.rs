//! Partitioned in-memory channel.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use replicator_core::channel::{Ack, Delivery, ReplicationChannel};
use replicator_core::error::ReplicationError;
use replicator_core::event::Batch;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug)]
struct Pending {
    batch: Batch,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct PartitionState {
    queue: VecDeque<Pending>,
    in_flight: Option<Pending>,
}

#[derive(Debug, Default)]
struct Partition {
    state: Mutex<PartitionState>,
    /// Signalled when a batch may have become receivable.
    ready: Notify,
    /// Signalled when queue space may have been freed.
    space: Notify,
}

/// In-process channel for one consumer group.
///
/// Each partition hands out at most one batch at a time: the next batch is
/// released only after the in-flight one is acknowledged, and a rejected
/// batch goes back to the head of its partition. `send` suspends while a
/// bounded partition is full.
#[derive(Debug)]
pub struct MemoryChannel {
    partitions: Vec<Partition>,
    capacity: usize,
}

impl MemoryChannel {
    /// Creates a channel with `partitions` unbounded partitions.
    #[must_use]
    pub fn new(partitions: u32) -> Self {
        Self::with_capacity(partitions, usize::MAX)
    }

    /// Creates a channel whose partitions hold at most `capacity` queued
    /// batches each.
    #[must_use]
    pub fn with_capacity(partitions: u32, capacity: usize) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Partition::default()).collect(),
            capacity: capacity.max(1),
        }
    }

    /// Number of batches queued (not in flight) on a partition.
    ///
    /// # Panics
    ///
    /// Panics if `partition` is out of range or the internal mutex is
    /// poisoned.
    pub fn queued(&self, partition: u32) -> usize {
        self.partitions[partition as usize].state.lock().unwrap().queue.len()
    }

    /// Returns true if a partition has a delivered, unresolved batch.
    ///
    /// # Panics
    ///
    /// Panics if `partition` is out of range or the internal mutex is
    /// poisoned.
    pub fn has_in_flight(&self, partition: u32) -> bool {
        self.partitions[partition as usize]
            .state
            .lock()
            .unwrap()
            .in_flight
            .is_some()
    }

    fn partition(&self, partition: u32) -> Result<&Partition, ReplicationError> {
        self.partitions.get(partition as usize).ok_or_else(|| {
            ReplicationError::TransportFailure(format!(
                "partition {partition} does not exist (channel has {})",
                self.partitions.len()
            ))
        })
    }

    fn lock(
        partition: &Partition,
    ) -> Result<std::sync::MutexGuard<'_, PartitionState>, ReplicationError> {
        partition
            .state
            .lock()
            .map_err(|_| ReplicationError::TransportFailure("partition lock poisoned".into()))
    }

    /// Finds the partition holding `batch_id` in flight and takes it out.
    fn take_in_flight(&self, batch_id: Uuid) -> Result<(&Partition, Pending), ReplicationError> {
        for partition in &self.partitions {
            let mut state = Self::lock(partition)?;
            let matches = state
                .in_flight
                .as_ref()
                .is_some_and(|pending| pending.batch.batch_id == batch_id);
            if matches {
                if let Some(pending) = state.in_flight.take() {
                    return Ok((partition, pending));
                }
            }
        }
        Err(ReplicationError::TransportFailure(format!(
            "batch {batch_id} is not in flight"
        )))
    }
}

#[async_trait]
impl ReplicationChannel for MemoryChannel {
    #[allow(clippy::cast_possible_truncation)]
    fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn send(&self, batch: &Batch) -> Result<Ack, ReplicationError> {
        let key = batch.partition_key().ok_or_else(|| {
            ReplicationError::InvalidBatch(format!("batch {} contains no events", batch.batch_id))
        })?;
        let index = key.partition(self.partitions());
        let partition = self.partition(index)?;

        loop {
            let space = partition.space.notified();
            {
                let mut state = Self::lock(partition)?;
                if state.queue.len() < self.capacity {
                    state.queue.push_back(Pending {
                        batch: batch.clone(),
                        deliveries: 0,
                    });
                    partition.ready.notify_waiters();
                    debug!(batch_id = %batch.batch_id, partition = index, "batch queued");
                    return Ok(Ack {
                        batch_id: batch.batch_id,
                        partition: index,
                    });
                }
            }
            debug!(partition = index, "partition full, waiting for space");
            space.await;
        }
    }

    async fn receive(&self, partition: u32) -> Result<Delivery, ReplicationError> {
        let slot = self.partition(partition)?;

        loop {
            let ready = slot.ready.notified();
            {
                let mut state = Self::lock(slot)?;
                if state.in_flight.is_none() {
                    if let Some(mut pending) = state.queue.pop_front() {
                        pending.deliveries += 1;
                        let delivery = Delivery {
                            batch: pending.batch.clone(),
                            partition,
                            delivery_count: pending.deliveries,
                        };
                        state.in_flight = Some(pending);
                        slot.space.notify_waiters();
                        return Ok(delivery);
                    }
                }
            }
            ready.await;
        }
    }

    async fn acknowledge(&self, batch_id: Uuid) -> Result<(), ReplicationError> {
        let (partition, _) = self.take_in_flight(batch_id)?;
        partition.ready.notify_waiters();
        debug!(%batch_id, "batch acknowledged");
        Ok(())
    }

    async fn reject(&self, batch_id: Uuid, reason: &str) -> Result<(), ReplicationError> {
        let (partition, pending) = self.take_in_flight(batch_id)?;
        warn!(%batch_id, deliveries = pending.deliveries, reason, "batch rejected, requeued");
        Self::lock(partition)?.queue.push_front(pending);
        partition.ready.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use replicator_core::event::{ChangeEvent, EntityType, Source};
    use replicator_test_support::FixedClock;

    fn batch_for(key: &str, version: i64) -> Batch {
        let clock = FixedClock(chrono::Utc::now());
        let event = ChangeEvent::update(
            Source::AdminService,
            EntityType::Company,
            key,
            version,
            serde_json::json!({ "id": key, "name": "Acme" }),
            &clock,
        );
        Batch::new(Source::AdminService, vec![event], &clock).unwrap()
    }

    #[tokio::test]
    async fn test_send_then_receive_delivers_batch() {
        // Arrange
        let channel = MemoryChannel::new(4);
        let batch = batch_for("C1", 1);

        // Act
        let ack = channel.send(&batch).await.unwrap();
        let delivery = channel.receive(ack.partition).await.unwrap();

        // Assert
        assert_eq!(ack.batch_id, batch.batch_id);
        assert_eq!(delivery.batch, batch);
        assert_eq!(delivery.partition, ack.partition);
        assert_eq!(delivery.delivery_count, 1);
    }

    #[tokio::test]
    async fn test_same_entity_batches_share_a_partition_in_order() {
        let channel = MemoryChannel::new(8);
        let first = batch_for("C1", 1);
        let second = batch_for("C1", 2);

        let ack1 = channel.send(&first).await.unwrap();
        let ack2 = channel.send(&second).await.unwrap();

        assert_eq!(ack1.partition, ack2.partition);
        let d1 = channel.receive(ack1.partition).await.unwrap();
        assert_eq!(d1.batch.batch_id, first.batch_id);
        channel.acknowledge(d1.batch.batch_id).await.unwrap();
        let d2 = channel.receive(ack1.partition).await.unwrap();
        assert_eq!(d2.batch.batch_id, second.batch_id);
    }

    #[tokio::test]
    async fn test_next_batch_waits_for_acknowledgement() {
        let channel = MemoryChannel::new(1);
        channel.send(&batch_for("C1", 1)).await.unwrap();
        channel.send(&batch_for("C1", 2)).await.unwrap();

        let _first = channel.receive(0).await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(50), channel.receive(0)).await;

        assert!(second.is_err(), "second batch must not be released while first is in flight");
        assert!(channel.has_in_flight(0));
        assert_eq!(channel.queued(0), 1);
    }

    #[tokio::test]
    async fn test_rejected_batch_is_redelivered_first() {
        let channel = MemoryChannel::new(1);
        let first = batch_for("C1", 1);
        let second = batch_for("C1", 2);
        channel.send(&first).await.unwrap();
        channel.send(&second).await.unwrap();

        let delivery = channel.receive(0).await.unwrap();
        channel
            .reject(delivery.batch.batch_id, "store unavailable")
            .await
            .unwrap();
        let redelivery = channel.receive(0).await.unwrap();

        assert_eq!(redelivery.batch.batch_id, first.batch_id);
        assert_eq!(redelivery.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_receive_waits_until_a_batch_is_sent() {
        let channel = Arc::new(MemoryChannel::new(1));
        let receiver = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.receive(0).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let batch = batch_for("C1", 1);
        channel.send(&batch).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.batch.batch_id, batch.batch_id);
    }

    #[tokio::test]
    async fn test_send_waits_for_space_when_partition_is_full() {
        let channel = Arc::new(MemoryChannel::with_capacity(1, 1));
        channel.send(&batch_for("C1", 1)).await.unwrap();

        let blocked = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.send(&batch_for("C1", 2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        let delivery = channel.receive(0).await.unwrap();
        let ack = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_ne!(ack.batch_id, delivery.batch.batch_id);
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_batch_fails() {
        let channel = MemoryChannel::new(2);

        let result = channel.acknowledge(Uuid::new_v4()).await;

        assert!(matches!(result, Err(ReplicationError::TransportFailure(_))));
    }

    #[tokio::test]
    async fn test_receive_from_missing_partition_fails() {
        let channel = MemoryChannel::new(2);

        let result = channel.receive(5).await;

        assert!(matches!(result, Err(ReplicationError::TransportFailure(_))));
    }
}
