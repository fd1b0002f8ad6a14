//! Replicator — producer side.
//!
//! Owning services group the change events of one committed transaction with
//! the envelope batcher and hand the sealed batch to the outbound publisher,
//! which retries transient transport failures with backoff.

pub mod application;
pub mod domain;
