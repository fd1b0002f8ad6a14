//! Inbound dispatcher: drains channel partitions and routes each change
//! event to its replica applier.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use replicator_core::channel::{Delivery, ReplicationChannel};
use replicator_core::clock::{Clock, SystemClock};
use replicator_core::dead_letter::{
    AttemptRecord, DeadLetterEntry, DeadLetterReason, DeadLetterSink,
};
use replicator_core::error::ReplicationError;
use replicator_core::event::{Batch, ChangeEvent};
use replicator_core::ledger::ApplyOutcome;
use replicator_core::retry::RetryPolicy;
use replicator_core::rng::{JitterRng, ThreadJitter};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::application::registry::ApplierRegistry;

/// Shortest pause between two renewals of a batch lease.
const MIN_LEASE_RENEWAL: Duration = Duration::from_millis(10);

/// How one event of a batch was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResolution {
    /// The applier reached a verdict.
    Outcome(ApplyOutcome),
    /// The event was parked in the dead-letter sink.
    DeadLettered(DeadLetterReason),
}

/// Per-batch tally of event resolutions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub applied: usize,
    pub rejected_stale: usize,
    pub rejected_duplicate: usize,
    /// Event IDs parked in the dead-letter sink.
    pub dead_lettered: Vec<Uuid>,
}

impl BatchReport {
    fn new(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            ..Self::default()
        }
    }

    fn record(&mut self, event_id: Uuid, resolution: EventResolution) {
        match resolution {
            EventResolution::Outcome(ApplyOutcome::Applied) => self.applied += 1,
            EventResolution::Outcome(ApplyOutcome::RejectedStale) => self.rejected_stale += 1,
            EventResolution::Outcome(ApplyOutcome::RejectedDuplicate) => {
                self.rejected_duplicate += 1;
            }
            EventResolution::DeadLettered(_) => self.dead_lettered.push(event_id),
        }
    }

    /// Total number of events resolved.
    #[must_use]
    pub fn resolved(&self) -> usize {
        self.applied + self.rejected_stale + self.rejected_duplicate + self.dead_lettered.len()
    }
}

/// Routes delivered batches to appliers, retrying transient failures per
/// event and dead-lettering what cannot be applied.
pub struct InboundDispatcher {
    channel: Arc<dyn ReplicationChannel>,
    registry: Arc<ApplierRegistry>,
    sink: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
    rng: Mutex<Box<dyn JitterRng>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InboundDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDispatcher")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl InboundDispatcher {
    /// Creates a dispatcher using thread-local jitter and the system clock.
    #[must_use]
    pub fn new(
        channel: Arc<dyn ReplicationChannel>,
        registry: Arc<ApplierRegistry>,
        sink: Arc<dyn DeadLetterSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            channel,
            registry,
            sink,
            retry,
            rng: Mutex::new(Box::new(ThreadJitter)),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock stamping attempt records.
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

    /// Resolves every event of `batch` in order.
    ///
    /// Each event is an independent unit of work: a failure never undoes or
    /// skips its siblings.
    ///
    /// # Errors
    ///
    /// Returns an error only if an event could be neither applied nor
    /// recorded in the dead-letter sink; the batch must then be redelivered.
    #[instrument(
        skip(self, batch),
        fields(batch_id = %batch.batch_id, source = %batch.source, events = batch.len())
    )]
    pub async fn process_batch(&self, batch: &Batch) -> Result<BatchReport, ReplicationError> {
        let mut report = BatchReport::new(batch.batch_id);
        for event in &batch.events {
            let resolution = self.resolve(batch.batch_id, event).await?;
            report.record(event.event_id, resolution);
        }
        info!(
            applied = report.applied,
            rejected_stale = report.rejected_stale,
            rejected_duplicate = report.rejected_duplicate,
            dead_lettered = report.dead_lettered.len(),
            "batch processed"
        );
        Ok(report)
    }

    /// Processes a delivery and settles it with the channel: acknowledged
    /// once every event is resolved, rejected otherwise.
    ///
    /// # Errors
    ///
    /// Returns the processing error after rejecting the batch, or the
    /// channel's error if settling fails.
    pub async fn handle_delivery(
        &self,
        delivery: Delivery,
    ) -> Result<BatchReport, ReplicationError> {
        let batch_id = delivery.batch.batch_id;
        if delivery.delivery_count > 1 {
            debug!(%batch_id, delivery_count = delivery.delivery_count, "redelivered batch");
        }
        let processed = match self.channel.lease() {
            Some(lease) => self.process_leased(&delivery.batch, lease).await?,
            None => self.process_batch(&delivery.batch).await,
        };
        match processed {
            Ok(report) => {
                self.channel.acknowledge(batch_id).await?;
                Ok(report)
            }
            Err(err) => {
                warn!(%batch_id, error = %err, "batch not fully resolved, rejecting");
                self.channel.reject(batch_id, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    /// Processes `batch` while renewing its lease every third of the lease
    /// period, so no other consumer of the group can claim the partition
    /// meanwhile.
    ///
    /// The outer error means the lease was lost: processing stops and the
    /// batch belongs to whoever holds it now, so it is neither acknowledged
    /// nor rejected here.
    async fn process_leased(
        &self,
        batch: &Batch,
        lease: Duration,
    ) -> Result<Result<BatchReport, ReplicationError>, ReplicationError> {
        let mut renewal = tokio::time::interval((lease / 3).max(MIN_LEASE_RENEWAL));
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renewal.tick().await;

        let processing = self.process_batch(batch);
        tokio::pin!(processing);
        loop {
            tokio::select! {
                biased;
                processed = &mut processing => return Ok(processed),
                _ = renewal.tick() => {
                    if let Err(err) = self.channel.extend_lease(batch.batch_id).await {
                        error!(
                            batch_id = %batch.batch_id,
                            error = %err,
                            "batch lease lost, abandoning batch"
                        );
                        return Err(err);
                    }
                    debug!(batch_id = %batch.batch_id, "batch lease renewed");
                }
            }
        }
    }

    async fn resolve(
        &self,
        batch_id: Uuid,
        event: &ChangeEvent,
    ) -> Result<EventResolution, ReplicationError> {
        let Some(applier) = self.registry.get(event.entity_type) else {
            let err = ReplicationError::UnknownEntityType(event.entity_type);
            let attempts = vec![self.attempt(1, &err)];
            return self
                .dead_letter(batch_id, event, DeadLetterReason::UnknownEntityType, attempts)
                .await;
        };

        let mut attempts = Vec::new();
        loop {
            let attempt = u32::try_from(attempts.len() + 1).unwrap_or(u32::MAX);
            let err = match applier.apply(event).await {
                Ok(outcome) => return Ok(EventResolution::Outcome(outcome)),
                Err(err) => err,
            };
            attempts.push(self.attempt(attempt, &err));

            if !err.is_retryable() {
                let reason = DeadLetterReason::for_error(&err);
                return self.dead_letter(batch_id, event, reason, attempts).await;
            }
            if !self.retry.allows_another(attempt) {
                return self
                    .dead_letter(batch_id, event, DeadLetterReason::RetriesExhausted, attempts)
                    .await;
            }

            let delay = self.backoff(attempt);
            warn!(
                event_id = %event.event_id,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "apply failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn dead_letter(
        &self,
        batch_id: Uuid,
        event: &ChangeEvent,
        reason: DeadLetterReason,
        attempts: Vec<AttemptRecord>,
    ) -> Result<EventResolution, ReplicationError> {
        let entry = DeadLetterEntry {
            event: event.clone(),
            batch_id,
            reason,
            attempts,
            recorded_at: self.clock.now(),
        };
        let last_error = entry.last_error().unwrap_or_default().to_owned();
        if let Err(err) = self.sink.record(entry).await {
            error!(event_id = %event.event_id, error = %err, "dead-letter sink unavailable");
            return Err(err);
        }
        warn!(
            event_id = %event.event_id,
            entity_type = %event.entity_type,
            entity_key = %event.entity_key,
            version = event.version,
            %reason,
            last_error = %last_error,
            "event dead-lettered"
        );
        Ok(EventResolution::DeadLettered(reason))
    }

    fn attempt(&self, attempt: u32, err: &ReplicationError) -> AttemptRecord {
        AttemptRecord {
            attempt,
            error: err.to_string(),
            at: self.clock.now(),
        }
    }

    fn backoff(&self, failed_attempts: u32) -> Duration {
        match self.rng.lock() {
            Ok(mut rng) => self.retry.delay_for_attempt(failed_attempts, rng.as_mut()),
            Err(poisoned) => self
                .retry
                .delay_for_attempt(failed_attempts, poisoned.into_inner().as_mut()),
        }
    }

    /// Drains one partition until `shutdown` turns true or its sender is
    /// dropped. Shutdown is only observed between batches.
    pub async fn run_partition(
        self: Arc<Self>,
        partition: u32,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(partition, "partition worker started");
        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let received = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                received = self.channel.receive(partition) => received,
            };

            let result = match received {
                Ok(delivery) => self.handle_delivery(delivery).await.map(|_| ()),
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => failures = 0,
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = self.backoff(failures);
                    warn!(partition, failures, error = %err, "partition worker backing off");
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!(partition, "partition worker stopped");
    }

    /// Spawns one worker task per partition.
    #[must_use]
    pub fn spawn_workers(
        self: &Arc<Self>,
        partitions: &[u32],
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        partitions
            .iter()
            .map(|&partition| {
                tokio::spawn(Arc::clone(self).run_partition(partition, shutdown.clone()))
            })
            .collect()
    }
}
