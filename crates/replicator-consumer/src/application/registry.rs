//! Applier registry: maps entity types to their replica applier.

use std::collections::HashMap;
use std::sync::Arc;

use replicator_core::event::EntityType;
use replicator_core::ledger::ReplicaStore;

use crate::application::applier::{DeletePolicy, EntityApplier, ReplicaApplier};
use crate::domain::replicas::{
    CompanyReplica, ElementReplica, FormulaReplica, ProductReplica, UserReplica,
};

/// The appliers a consuming service has registered.
#[derive(Clone, Default)]
pub struct ApplierRegistry {
    appliers: HashMap<EntityType, Arc<dyn ReplicaApplier>>,
}

impl std::fmt::Debug for ApplierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplierRegistry")
            .field("entity_types", &self.entity_types())
            .finish()
    }
}

impl ApplierRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the built-in applier of each listed entity type, all
    /// writing through `store`.
    #[must_use]
    pub fn standard(
        store: &Arc<dyn ReplicaStore>,
        delete_policy: DeletePolicy,
        entity_types: &[EntityType],
    ) -> Self {
        let mut registry = Self::new();
        for entity_type in entity_types {
            let store = Arc::clone(store);
            let applier: Arc<dyn ReplicaApplier> = match entity_type {
                EntityType::Company => {
                    Arc::new(EntityApplier::<CompanyReplica>::new(store, delete_policy))
                }
                EntityType::User => {
                    Arc::new(EntityApplier::<UserReplica>::new(store, delete_policy))
                }
                EntityType::Product => {
                    Arc::new(EntityApplier::<ProductReplica>::new(store, delete_policy))
                }
                EntityType::Element => {
                    Arc::new(EntityApplier::<ElementReplica>::new(store, delete_policy))
                }
                EntityType::Formula => {
                    Arc::new(EntityApplier::<FormulaReplica>::new(store, delete_policy))
                }
            };
            registry.register(applier);
        }
        registry
    }

    /// Registers `applier` for its entity type, replacing any previous one.
    pub fn register(&mut self, applier: Arc<dyn ReplicaApplier>) -> &mut Self {
        self.appliers.insert(applier.entity_type(), applier);
        self
    }

    /// The applier for `entity_type`, if one is registered.
    #[must_use]
    pub fn get(&self, entity_type: EntityType) -> Option<Arc<dyn ReplicaApplier>> {
        self.appliers.get(&entity_type).cloned()
    }

    /// Registered entity types, sorted.
    #[must_use]
    pub fn entity_types(&self) -> Vec<EntityType> {
        let mut types: Vec<EntityType> = self.appliers.keys().copied().collect();
        types.sort();
        types
    }
}
