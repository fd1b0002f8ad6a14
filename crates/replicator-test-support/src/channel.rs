//! Test channels — recording, leasing and failing `ReplicationChannel`
//! implementations.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use replicator_core::channel::{Ack, Delivery, ReplicationChannel};
use replicator_core::error::ReplicationError;
use replicator_core::event::Batch;
use uuid::Uuid;

/// A send-only channel that records every accepted batch. The first
/// `failures` sends report a `TransportFailure`.
#[derive(Debug)]
pub struct RecordingChannel {
    partitions: u32,
    sent: Mutex<Vec<Batch>>,
    failures_remaining: AtomicU32,
    send_calls: AtomicU32,
}

impl RecordingChannel {
    /// Creates a channel that accepts every send.
    #[must_use]
    pub fn new(partitions: u32) -> Self {
        Self::failing_first(partitions, 0)
    }

    /// Creates a channel whose first `failures` sends fail.
    #[must_use]
    pub fn failing_first(partitions: u32, failures: u32) -> Self {
        Self {
            partitions,
            sent: Mutex::new(Vec::new()),
            failures_remaining: AtomicU32::new(failures),
            send_calls: AtomicU32::new(0),
        }
    }

    /// Snapshot of every accepted batch.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn sent_batches(&self) -> Vec<Batch> {
        self.sent.lock().unwrap().clone()
    }

    /// Number of `send` calls, failed ones included.
    pub fn send_calls(&self) -> u32 {
        self.send_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicationChannel for RecordingChannel {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn send(&self, batch: &Batch) -> Result<Ack, ReplicationError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ReplicationError::TransportFailure("broker unreachable".into()));
        }
        let partition = batch
            .partition_key()
            .map_or(0, |key| key.partition(self.partitions));
        self.sent.lock().unwrap().push(batch.clone());
        Ok(Ack {
            batch_id: batch.batch_id,
            partition,
        })
    }

    async fn receive(&self, _partition: u32) -> Result<Delivery, ReplicationError> {
        Err(ReplicationError::TransportFailure(
            "recording channel does not deliver".into(),
        ))
    }

    async fn acknowledge(&self, _batch_id: Uuid) -> Result<(), ReplicationError> {
        Ok(())
    }

    async fn reject(&self, _batch_id: Uuid, _reason: &str) -> Result<(), ReplicationError> {
        Ok(())
    }
}

/// A channel whose every operation reports a `TransportFailure`.
#[derive(Debug)]
pub struct FailingChannel;

#[async_trait]
impl ReplicationChannel for FailingChannel {
    fn partitions(&self) -> u32 {
        1
    }

    async fn send(&self, _batch: &Batch) -> Result<Ack, ReplicationError> {
        Err(ReplicationError::TransportFailure("broker unreachable".into()))
    }

    async fn receive(&self, _partition: u32) -> Result<Delivery, ReplicationError> {
        Err(ReplicationError::TransportFailure("broker unreachable".into()))
    }

    async fn acknowledge(&self, _batch_id: Uuid) -> Result<(), ReplicationError> {
        Err(ReplicationError::TransportFailure("broker unreachable".into()))
    }

    async fn reject(&self, _batch_id: Uuid, _reason: &str) -> Result<(), ReplicationError> {
        Err(ReplicationError::TransportFailure("broker unreachable".into()))
    }
}

/// Wraps a channel with expiring reservations and counts lease renewals.
/// After [`LeasingChannel::revoke`], renewals fail as if another consumer
/// had taken over the batch.
pub struct LeasingChannel {
    inner: Arc<dyn ReplicationChannel>,
    lease: Duration,
    renewals: AtomicU32,
    revoked: AtomicBool,
}

impl std::fmt::Debug for LeasingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasingChannel")
            .field("lease", &self.lease)
            .field("renewals", &self.renewals)
            .field("revoked", &self.revoked)
            .finish_non_exhaustive()
    }
}

impl LeasingChannel {
    #[must_use]
    pub fn new(inner: Arc<dyn ReplicationChannel>, lease: Duration) -> Self {
        Self {
            inner,
            lease,
            renewals: AtomicU32::new(0),
            revoked: AtomicBool::new(false),
        }
    }

    /// Makes every later renewal fail.
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    /// Number of successful lease renewals.
    pub fn renewals(&self) -> u32 {
        self.renewals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicationChannel for LeasingChannel {
    fn partitions(&self) -> u32 {
        self.inner.partitions()
    }

    async fn send(&self, batch: &Batch) -> Result<Ack, ReplicationError> {
        self.inner.send(batch).await
    }

    async fn receive(&self, partition: u32) -> Result<Delivery, ReplicationError> {
        self.inner.receive(partition).await
    }

    async fn acknowledge(&self, batch_id: Uuid) -> Result<(), ReplicationError> {
        self.inner.acknowledge(batch_id).await
    }

    async fn reject(&self, batch_id: Uuid, reason: &str) -> Result<(), ReplicationError> {
        self.inner.reject(batch_id, reason).await
    }

    fn lease(&self) -> Option<Duration> {
        Some(self.lease)
    }

    async fn extend_lease(&self, batch_id: Uuid) -> Result<(), ReplicationError> {
        if self.revoked.load(Ordering::SeqCst) {
            return Err(ReplicationError::TransportFailure(format!(
                "lease on batch {batch_id} was taken over"
            )));
        }
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
