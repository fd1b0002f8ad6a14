//! Command handlers for the producer side.
//!
//! These orchestrate version stamping, envelope batching and publishing for
//! a committed owning-service transaction.

use replicator_core::error::ReplicationError;
use replicator_core::ledger::LedgerKey;
use replicator_core::versioning::VersionSequencer;
use tracing::instrument;
use uuid::Uuid;

use crate::application::publisher::OutboundPublisher;
use crate::domain::batcher::EnvelopeBatcher;
use crate::domain::commands::PublishTransaction;

/// Result of a successfully published transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    /// The batch that carried the transaction.
    pub batch_id: Uuid,
    /// Partition the batch was routed to.
    pub partition: u32,
    /// `(event_id, version)` of every published event, in commit order.
    pub events: Vec<(Uuid, i64)>,
}

/// Handles `PublishTransaction`: stamps versions where the owning store did
/// not assign one, seals the changes into one batch and publishes it.
///
/// # Errors
///
/// Returns `ReplicationError::InvalidBatch` if the transaction is empty or a
/// change is not publishable, or the publisher's error if the channel
/// refuses the batch.
#[instrument(
    skip(command, sequencer, publisher),
    fields(correlation_id = %command.correlation_id, source = %command.source)
)]
pub async fn handle_publish_transaction(
    command: &PublishTransaction,
    sequencer: &dyn VersionSequencer,
    publisher: &OutboundPublisher,
) -> Result<PublishResult, ReplicationError> {
    let clock = publisher.clock();
    let mut batcher = EnvelopeBatcher::new(command.source, command.correlation_id);

    for change in &command.changes {
        if change.source != command.source {
            return Err(ReplicationError::InvalidBatch(format!(
                "change to {}/{} comes from {}, not {}",
                change.entity_type, change.entity_key, change.source, command.source
            )));
        }
        let version = match change.version {
            Some(version) => version,
            None => {
                let key = LedgerKey::new(change.source, change.entity_type, &*change.entity_key);
                sequencer.next_version(&key).await?
            }
        };
        batcher.add(
            change.process,
            change.entity_type,
            change.entity_key.clone(),
            version,
            change.payload.clone(),
            clock,
        )?;
    }

    let batch = batcher.seal(clock)?;
    let ack = publisher.publish(&batch).await?;

    Ok(PublishResult {
        batch_id: ack.batch_id,
        partition: ack.partition,
        events: batch
            .events
            .iter()
            .map(|event| (event.event_id, event.version))
            .collect(),
    })
}
