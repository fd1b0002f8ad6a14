//! Replica appliers: apply one change event to the local replica under the
//! idempotency ledger's freshest-version rule.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use replicator_core::error::ReplicationError;
use replicator_core::event::{ChangeEvent, EntityType, MAX_ENTITY_KEY_LEN, Process};
use replicator_core::ledger::{
    ApplyOutcome, ReplicaMutation, ReplicaStore, VersionCheck,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::domain::replicas::{ReplicaShape, decode};

/// What a `DELETE` does to the replica record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Remove the record.
    #[default]
    Remove,
    /// Keep the record with `deleted_at` set.
    Tombstone,
}

impl DeletePolicy {
    fn mutation(self) -> ReplicaMutation {
        match self {
            DeletePolicy::Remove => ReplicaMutation::Remove,
            DeletePolicy::Tombstone => ReplicaMutation::Tombstone,
        }
    }
}

/// Applies change events of one entity type to the local replica.
#[async_trait]
pub trait ReplicaApplier: Send + Sync {
    /// The entity type this applier owns.
    fn entity_type(&self) -> EntityType;

    /// Applies `event` if its version is newer than the ledger's.
    ///
    /// Stale and duplicate deliveries are reported as outcomes and leave the
    /// replica untouched.
    async fn apply(&self, event: &ChangeEvent) -> Result<ApplyOutcome, ReplicationError>;
}

/// Applier for any [`ReplicaShape`], backed by a ledger-guarded store.
pub struct EntityApplier<R> {
    store: Arc<dyn ReplicaStore>,
    delete_policy: DeletePolicy,
    shape: PhantomData<fn() -> R>,
}

impl<R> std::fmt::Debug for EntityApplier<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityApplier")
            .field("delete_policy", &self.delete_policy)
            .finish_non_exhaustive()
    }
}

impl<R: ReplicaShape> EntityApplier<R> {
    /// Creates an applier writing through `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ReplicaStore>, delete_policy: DeletePolicy) -> Self {
        Self {
            store,
            delete_policy,
            shape: PhantomData,
        }
    }

    /// The applier's delete policy.
    #[must_use]
    pub fn delete_policy(&self) -> DeletePolicy {
        self.delete_policy
    }

    /// Decodes an `UPDATE` into an upsert. When the payload is malformed but
    /// its version is already covered by the ledger, the stale or duplicate
    /// outcome wins: the event would never have been applied anyway.
    async fn upsert_for(
        &self,
        event: &ChangeEvent,
    ) -> Result<Result<ReplicaMutation, ApplyOutcome>, ReplicationError> {
        match decode::<R>(event) {
            Ok(shape) => {
                let document = serde_json::to_value(&shape).map_err(|e| {
                    ReplicationError::malformed(
                        event.event_id,
                        format!("cannot encode replica: {e}"),
                    )
                })?;
                Ok(Ok(ReplicaMutation::Upsert(document)))
            }
            Err(err) => {
                let current = self.store.version(&event.ledger_key()).await?;
                match VersionCheck::classify(current, event.version) {
                    VersionCheck::Applied => Err(err),
                    covered => Ok(Err(ApplyOutcome::from(covered))),
                }
            }
        }
    }
}

#[async_trait]
impl<R: ReplicaShape> ReplicaApplier for EntityApplier<R> {
    fn entity_type(&self) -> EntityType {
        R::ENTITY_TYPE
    }

    #[instrument(
        skip(self, event),
        fields(
            event_id = %event.event_id,
            source = %event.source,
            entity_type = %event.entity_type,
            entity_key = %event.entity_key,
            version = event.version,
            correlation_id = %event.correlation_id,
        )
    )]
    async fn apply(&self, event: &ChangeEvent) -> Result<ApplyOutcome, ReplicationError> {
        if event.entity_type != R::ENTITY_TYPE {
            return Err(ReplicationError::malformed(
                event.event_id,
                format!(
                    "{} event routed to the {} applier",
                    event.entity_type,
                    R::ENTITY_TYPE
                ),
            ));
        }

        if event.entity_key.chars().count() > MAX_ENTITY_KEY_LEN {
            return Err(ReplicationError::malformed(
                event.event_id,
                format!("entity key exceeds {MAX_ENTITY_KEY_LEN} characters"),
            ));
        }

        let mutation = match event.process {
            Process::Update => match self.upsert_for(event).await? {
                Ok(mutation) => mutation,
                Err(outcome) => {
                    debug!(?outcome, "malformed payload already covered by ledger");
                    return Ok(outcome);
                }
            },
            Process::Delete => self.delete_policy.mutation(),
        };

        let check = self
            .store
            .apply_versioned(&event.ledger_key(), event.version, mutation)
            .await?;

        match check {
            VersionCheck::Applied => info!(process = %event.process, "replica updated"),
            VersionCheck::Duplicate { current } | VersionCheck::Stale { current } => {
                debug!(current, ?check, "event discarded by ledger");
            }
        }
        Ok(ApplyOutcome::from(check))
    }
}
