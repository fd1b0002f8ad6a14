//! Shared application state.

use std::sync::Arc;

use replicator_consumer::application::reconciler::Reconciler;
use replicator_consumer::application::registry::ApplierRegistry;
use replicator_core::ledger::{IdempotencyLedger, ReplicaStore};
use replicator_core::versioning::VersionSequencer;
use replicator_publisher::application::publisher::OutboundPublisher;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Publishes ingested changes to the channel.
    pub publisher: Arc<OutboundPublisher>,
    /// Stamps versions the producer left out.
    pub sequencer: Arc<dyn VersionSequencer>,
    /// Replica records served to operators.
    pub store: Arc<dyn ReplicaStore>,
    /// Ledger entries served to operators.
    pub ledger: Arc<dyn IdempotencyLedger>,
    /// Appliers of the entity types this instance replicates.
    pub registry: Arc<ApplierRegistry>,
    /// Dead-letter operations.
    pub reconciler: Arc<Reconciler>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("publisher", &self.publisher)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
