//! Commands accepted by the producer side.

use replicator_core::event::{EntityType, Process, Source};
use uuid::Uuid;

/// One mutation an owning service wants replicated.
#[derive(Debug, Clone)]
pub struct PublishChange {
    /// The owning service.
    pub source: Source,
    /// Mutation kind.
    pub process: Process,
    /// Entity type of the mutated instance.
    pub entity_type: EntityType,
    /// Stable key of the mutated instance.
    pub entity_key: String,
    /// Version already assigned by the owning store. When absent the
    /// version sequencer stamps the next one.
    pub version: Option<i64>,
    /// Full entity snapshot for `UPDATE`.
    pub payload: Option<serde_json::Value>,
}

/// Every change committed by one owning-service transaction.
#[derive(Debug, Clone)]
pub struct PublishTransaction {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The owning service that committed the transaction.
    pub source: Source,
    /// Changes in commit order.
    pub changes: Vec<PublishChange>,
}
