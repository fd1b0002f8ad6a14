//! Outbound publisher: hands sealed batches to the replication channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use replicator_core::channel::{Ack, ReplicationChannel};
use replicator_core::clock::{Clock, SystemClock};
use replicator_core::error::ReplicationError;
use replicator_core::event::{Batch, EntityType, Process, Source};
use replicator_core::retry::RetryPolicy;
use replicator_core::rng::{JitterRng, ThreadJitter};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::batcher::EnvelopeBatcher;

/// Publishes batches with bounded retry.
///
/// Holds no state between calls beyond the jitter source: a batch is either
/// accepted by the channel before `publish` returns, or the last transport
/// error is returned so the caller can roll back or queue it.
pub struct OutboundPublisher {
    channel: Arc<dyn ReplicationChannel>,
    retry: RetryPolicy,
    rng: Mutex<Box<dyn JitterRng>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for OutboundPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundPublisher")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl OutboundPublisher {
    /// Creates a publisher using thread-local jitter and the system clock.
    #[must_use]
    pub fn new(channel: Arc<dyn ReplicationChannel>, retry: RetryPolicy) -> Self {
        Self {
            channel,
            retry,
            rng: Mutex::new(Box::new(ThreadJitter)),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock stamping events and batches.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the jitter source of the backoff schedule.
    #[must_use]
    pub fn with_jitter(mut self, rng: impl JitterRng + 'static) -> Self {
        self.rng = Mutex::new(Box::new(rng));
        self
    }

    /// The clock stamping events and batches.
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// The retry schedule.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Validates `batch` and sends it, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::InvalidBatch` without touching the channel
    /// if the batch is not publishable, or the last channel error once the
    /// retry budget is spent or a non-retryable error occurs.
    #[instrument(
        skip(self, batch),
        fields(batch_id = %batch.batch_id, source = %batch.source, events = batch.len())
    )]
    pub async fn publish(&self, batch: &Batch) -> Result<Ack, ReplicationError> {
        batch.validate()?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.channel.send(batch).await {
                Ok(ack) => {
                    info!(partition = ack.partition, attempts, "batch published");
                    return Ok(ack);
                }
                Err(err) if err.is_retryable() && self.retry.allows_another(attempts) => {
                    let delay = self.backoff(attempts);
                    warn!(
                        attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(attempts, error = %err, "publish failed");
                    return Err(err);
                }
            }
        }
    }

    /// Wraps a single change in its own batch and publishes it.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::InvalidBatch` if the change is not
    /// publishable, or the channel error once retries are exhausted.
    pub async fn publish_change(
        &self,
        source: Source,
        process: Process,
        entity_type: EntityType,
        entity_key: impl Into<String>,
        version: i64,
        payload: Option<serde_json::Value>,
    ) -> Result<Ack, ReplicationError> {
        let mut batcher = EnvelopeBatcher::new(source, Uuid::now_v7());
        batcher.add(
            process,
            entity_type,
            entity_key,
            version,
            payload,
            self.clock.as_ref(),
        )?;
        let batch = batcher.seal(self.clock.as_ref())?;
        self.publish(&batch).await
    }

    fn backoff(&self, failed_attempts: u32) -> Duration {
        match self.rng.lock() {
            Ok(mut rng) => self.retry.delay_for_attempt(failed_attempts, rng.as_mut()),
            Err(poisoned) => self
                .retry
                .delay_for_attempt(failed_attempts, poisoned.into_inner().as_mut()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use replicator_channel::MemoryChannel;
    use replicator_core::event::ChangeEvent;
    use replicator_test_support::{FailingChannel, FixedClock, NoJitter, RecordingChannel};
    use serde_json::json;

    use super::*;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
    }

    fn publisher(channel: Arc<dyn ReplicationChannel>, max_attempts: u32) -> OutboundPublisher {
        let clock = FixedClock(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        OutboundPublisher::new(channel, fast_retry(max_attempts))
            .with_clock(Arc::new(clock))
            .with_jitter(NoJitter)
    }

    fn company_batch(key: &str, version: i64) -> Batch {
        let clock = FixedClock(Utc::now());
        let event = ChangeEvent::update(
            Source::AdminService,
            EntityType::Company,
            key,
            version,
            json!({ "id": key, "name": "Acme" }),
            &clock,
        );
        Batch::new(Source::AdminService, vec![event], &clock).unwrap()
    }

    #[tokio::test]
    async fn test_publish_hands_batch_to_channel() {
        // Arrange
        let channel = Arc::new(RecordingChannel::new(4));
        let publisher = publisher(channel.clone(), 3);
        let batch = company_batch("C1", 1);

        // Act
        let ack = publisher.publish(&batch).await.unwrap();

        // Assert
        assert_eq!(ack.batch_id, batch.batch_id);
        assert_eq!(channel.sent_batches(), vec![batch]);
        assert_eq!(channel.send_calls(), 1);
    }

    #[tokio::test]
    async fn test_publish_retries_transient_failures() {
        let channel = Arc::new(RecordingChannel::failing_first(4, 2));
        let publisher = publisher(channel.clone(), 3);

        let result = publisher.publish(&company_batch("C1", 1)).await;

        assert!(result.is_ok());
        assert_eq!(channel.send_calls(), 3);
        assert_eq!(channel.sent_batches().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_returns_last_error_when_budget_is_spent() {
        let channel = Arc::new(RecordingChannel::failing_first(4, 10));
        let publisher = publisher(channel.clone(), 3);

        let result = publisher.publish(&company_batch("C1", 1)).await;

        assert!(matches!(result, Err(ReplicationError::TransportFailure(_))));
        assert_eq!(channel.send_calls(), 3);
        assert!(channel.sent_batches().is_empty());
    }

    #[tokio::test]
    async fn test_publish_rejects_invalid_batch_without_sending() {
        let channel = Arc::new(RecordingChannel::new(4));
        let publisher = publisher(channel.clone(), 3);
        let mut batch = company_batch("C1", 1);
        batch.events[0].version = 0;

        let result = publisher.publish(&batch).await;

        assert!(matches!(result, Err(ReplicationError::InvalidBatch(_))));
        assert_eq!(channel.send_calls(), 0);
    }

    #[tokio::test]
    async fn test_publish_rejects_empty_batch() {
        let channel = Arc::new(RecordingChannel::new(4));
        let publisher = publisher(channel.clone(), 3);
        let mut batch = company_batch("C1", 1);
        batch.events.clear();

        let result = publisher.publish(&batch).await;

        assert!(matches!(result, Err(ReplicationError::InvalidBatch(_))));
        assert_eq!(channel.send_calls(), 0);
    }

    #[tokio::test]
    async fn test_publish_with_no_retry_fails_after_one_attempt() {
        let publisher = OutboundPublisher::new(Arc::new(FailingChannel), RetryPolicy::no_retry());

        let result = publisher.publish(&company_batch("C1", 1)).await;

        assert!(matches!(result, Err(ReplicationError::TransportFailure(_))));
    }

    #[tokio::test]
    async fn test_publish_change_wraps_single_event() {
        let channel = Arc::new(MemoryChannel::new(4));
        let publisher = publisher(channel.clone(), 3);

        let ack = publisher
            .publish_change(
                Source::ProductsService,
                Process::Update,
                EntityType::Product,
                "P7",
                3,
                Some(json!({ "id": "P7", "name": "Resin", "active": true })),
            )
            .await
            .unwrap();
        let delivery = channel.receive(ack.partition).await.unwrap();

        assert_eq!(delivery.batch.batch_id, ack.batch_id);
        assert_eq!(delivery.batch.events.len(), 1);
        let event = &delivery.batch.events[0];
        assert_eq!(event.source, Source::ProductsService);
        assert_eq!(event.entity_key, "P7");
        assert_eq!(event.version, 3);
    }

    #[tokio::test]
    async fn test_publish_change_drops_delete_payload() {
        let channel = Arc::new(RecordingChannel::new(1));
        let publisher = publisher(channel.clone(), 1);

        publisher
            .publish_change(
                Source::AdminService,
                Process::Delete,
                EntityType::User,
                "U1",
                2,
                Some(json!({ "id": "U1" })),
            )
            .await
            .unwrap();

        let sent = channel.sent_batches();
        assert_eq!(sent[0].events[0].payload, None);
    }
}
