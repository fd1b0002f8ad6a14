//! Replication database schema.

use sqlx::migrate::Migrator;

/// Embedded migrations of the workspace `migrations/` directory.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// DDL of the replication tables, as applied by the first migration.
pub const REPLICATION_SCHEMA: &str = include_str!("../../../migrations/0001_replication.sql");

/// DDL of the channel quarantine, as applied by the second migration.
pub const QUARANTINE_SCHEMA: &str =
    include_str!("../../../migrations/0002_channel_quarantine.sql");

/// Highest applied version per entity.
pub const LEDGER_TABLE: &str = "replication_ledger";
/// Consumer-local replica documents.
pub const REPLICA_TABLE: &str = "replica_records";
/// Events held for reconciliation.
pub const DEAD_LETTER_TABLE: &str = "dead_letters";
/// Partitioned replication log.
pub const BATCH_TABLE: &str = "replication_batches";
/// Consumer group read positions and leases.
pub const CURSOR_TABLE: &str = "replication_cursors";
/// Producer-side version counters.
pub const VERSION_TABLE: &str = "replication_versions";
/// Log entries a consumer group could not decode.
pub const QUARANTINE_TABLE: &str = "replication_quarantine";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creates_every_table() {
        for table in [
            LEDGER_TABLE,
            REPLICA_TABLE,
            DEAD_LETTER_TABLE,
            BATCH_TABLE,
            CURSOR_TABLE,
            VERSION_TABLE,
        ] {
            let ddl = format!("CREATE TABLE IF NOT EXISTS {table} (");
            assert!(REPLICATION_SCHEMA.contains(&ddl), "missing {table}");
        }
    }

    #[test]
    fn test_quarantine_is_keyed_per_group_and_event() {
        let ddl = format!("CREATE TABLE IF NOT EXISTS {QUARANTINE_TABLE} (");

        assert!(QUARANTINE_SCHEMA.contains(&ddl));
        assert!(QUARANTINE_SCHEMA.contains("PRIMARY KEY (consumer_group, seq, event_index)"));
    }

    #[test]
    fn test_ledger_upsert_relies_on_composite_primary_key() {
        assert!(REPLICATION_SCHEMA.contains("PRIMARY KEY (source, entity_type, entity_key)"));
    }
}
