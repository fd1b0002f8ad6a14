//! Replicator Core — shared replication model and seams.
//!
//! This crate defines the change-event model and the traits every other
//! replicator crate plugs into: the transport channel, the replica store with
//! its idempotency ledger, and the dead-letter sink. It contains no
//! infrastructure code.

pub mod channel;
pub mod clock;
pub mod dead_letter;
pub mod error;
pub mod event;
pub mod ledger;
pub mod partition;
pub mod retry;
pub mod rng;
pub mod versioning;
