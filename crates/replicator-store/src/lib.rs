//! Replicator — `PostgreSQL` storage.
//!
//! Every table lives in `migrations/`; [`schema::MIGRATOR`] applies them.

pub mod pg_channel;
pub mod pg_dead_letter_sink;
pub mod pg_replica_store;
pub mod pg_version_sequencer;
pub mod schema;

use replicator_core::error::ReplicationError;

/// Maps a database failure onto the replication taxonomy. Every database
/// error is treated as transient.
pub(crate) fn store_error(err: sqlx::Error) -> ReplicationError {
    ReplicationError::StoreUnavailable(err.to_string())
}

/// Builds the error for a row that no longer decodes.
pub(crate) fn corrupt_row(table: &str, detail: impl std::fmt::Display) -> ReplicationError {
    ReplicationError::StoreUnavailable(format!("corrupt row in {table}: {detail}"))
}
