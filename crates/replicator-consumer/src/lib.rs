//! Replicator — consumer side.
//!
//! Receives batches per partition, routes every change event to the replica
//! applier of its entity type, and parks events that cannot be applied in
//! the dead-letter sink for operator reconciliation.

pub mod application;
pub mod domain;
