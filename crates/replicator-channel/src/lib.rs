//! Replicator Channel — in-process transport for the replication pipeline.
//!
//! `MemoryChannel` serves a single consumer group inside one process, for
//! deployments where owning and consuming services share a binary, and for
//! end-to-end tests. Durable multi-process delivery lives in
//! `replicator-store`'s `PgChannel`.

pub mod memory;

pub use memory::MemoryChannel;
