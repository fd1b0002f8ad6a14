//! Integration tests for `PgReplicaStore`, `PgDeadLetterSink` and
//! `PgVersionSequencer`.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use replicator_core::dead_letter::{
    AttemptRecord, DeadLetterEntry, DeadLetterReason, DeadLetterSink,
};
use replicator_core::event::{ChangeEvent, EntityType, Source};
use replicator_core::ledger::{
    IdempotencyLedger, LedgerKey, ReplicaMutation, ReplicaStore, VersionCheck,
};
use replicator_core::versioning::VersionSequencer;
use replicator_store::pg_dead_letter_sink::PgDeadLetterSink;
use replicator_store::pg_replica_store::PgReplicaStore;
use replicator_store::pg_version_sequencer::PgVersionSequencer;
use replicator_test_support::ManualClock;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

fn c1() -> LedgerKey {
    LedgerKey::new(Source::AdminService, EntityType::Company, "C1")
}

fn upsert(name: &str) -> ReplicaMutation {
    ReplicaMutation::Upsert(json!({ "id": "C1", "name": name }))
}

// --- apply_versioned ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_first_version_inserts_record_and_ledger(pool: PgPool) {
    let store = PgReplicaStore::new(pool);

    let check = store.apply_versioned(&c1(), 1, upsert("Acme")).await.unwrap();

    assert_eq!(check, VersionCheck::Applied);
    let record = store.load_record(&c1()).await.unwrap().unwrap();
    assert_eq!(record.data["name"], "Acme");
    assert_eq!(record.version, 1);
    assert!(!record.is_tombstone());
    assert_eq!(store.version(&c1()).await.unwrap(), Some(1));
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_out_of_order_update_is_stale(pool: PgPool) {
    let store = PgReplicaStore::new(pool);
    store.apply_versioned(&c1(), 2, upsert("Acme Corp")).await.unwrap();

    let check = store.apply_versioned(&c1(), 1, upsert("Acme")).await.unwrap();

    assert_eq!(check, VersionCheck::Stale { current: 2 });
    let record = store.load_record(&c1()).await.unwrap().unwrap();
    assert_eq!(record.data["name"], "Acme Corp");
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_redelivered_version_is_duplicate(pool: PgPool) {
    let store = PgReplicaStore::new(pool);
    store.apply_versioned(&c1(), 1, upsert("Acme")).await.unwrap();

    let check = store.apply_versioned(&c1(), 1, upsert("Other")).await.unwrap();

    assert_eq!(check, VersionCheck::Duplicate { current: 1 });
    let record = store.load_record(&c1()).await.unwrap().unwrap();
    assert_eq!(record.data["name"], "Acme");
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_delete_blocks_older_update(pool: PgPool) {
    let store = PgReplicaStore::new(pool);
    store.apply_versioned(&c1(), 1, upsert("Acme")).await.unwrap();
    store
        .apply_versioned(&c1(), 2, ReplicaMutation::Remove)
        .await
        .unwrap();

    let check = store.apply_versioned(&c1(), 1, upsert("Acme")).await.unwrap();

    assert_eq!(check, VersionCheck::Stale { current: 2 });
    assert!(store.load_record(&c1()).await.unwrap().is_none());
    let entry = store.entry(&c1()).await.unwrap().unwrap();
    assert!(entry.deleted);
    assert_eq!(entry.version, 2);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_tombstone_keeps_record_marked_deleted(pool: PgPool) {
    let store = PgReplicaStore::new(pool);
    store.apply_versioned(&c1(), 1, upsert("Acme")).await.unwrap();

    store
        .apply_versioned(&c1(), 2, ReplicaMutation::Tombstone)
        .await
        .unwrap();

    let record = store.load_record(&c1()).await.unwrap().unwrap();
    assert!(record.is_tombstone());
    assert_eq!(record.version, 2);
    assert_eq!(record.data["name"], "Acme");
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_concurrent_duplicates_apply_once(pool: PgPool) {
    let store = Arc::new(PgReplicaStore::new(pool));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.apply_versioned(&c1(), 1, upsert("Acme")).await })
        })
        .collect();
    let mut applied = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_applied() {
            applied += 1;
        }
    }

    assert_eq!(applied, 1);
}

// --- retention ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_purge_drops_only_old_deletions(pool: PgPool) {
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let store = PgReplicaStore::with_clock(pool, clock.clone());
    let old = LedgerKey::new(Source::AdminService, EntityType::Company, "OLD");
    let live = LedgerKey::new(Source::AdminService, EntityType::Company, "LIVE");
    store
        .apply_versioned(&old, 1, ReplicaMutation::Tombstone)
        .await
        .unwrap();
    store.apply_versioned(&live, 1, upsert("Acme")).await.unwrap();

    let purged = store
        .purge_tombstones_before(start + Duration::days(1))
        .await
        .unwrap();

    assert_eq!(purged, 1);
    assert!(store.entry(&old).await.unwrap().is_none());
    assert!(store.load_record(&old).await.unwrap().is_none());
    assert!(store.entry(&live).await.unwrap().is_some());
}

// --- dead letters ---

fn parked(version: i64, reason: DeadLetterReason, error: &str) -> DeadLetterEntry {
    let at = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
    let event = ChangeEvent::update(
        Source::ProductsService,
        EntityType::Product,
        "P1",
        version,
        json!({ "id": "P1" }),
        &replicator_test_support::FixedClock(at),
    );
    DeadLetterEntry {
        event,
        batch_id: Uuid::new_v4(),
        reason,
        attempts: vec![AttemptRecord {
            attempt: 1,
            error: error.to_owned(),
            at,
        }],
        recorded_at: at,
    }
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_record_same_event_twice_merges_attempts(pool: PgPool) {
    let sink = PgDeadLetterSink::new(pool);
    let first = parked(1, DeadLetterReason::RetriesExhausted, "timeout");
    let mut second = first.clone();
    second.reason = DeadLetterReason::MalformedEvent;
    second.attempts[0].attempt = 2;
    second.attempts[0].error = "bad payload".into();

    sink.record(first.clone()).await.unwrap();
    sink.record(second).await.unwrap();

    assert_eq!(sink.count().await.unwrap(), 1);
    let stored = sink.get(first.event_id()).await.unwrap().unwrap();
    assert_eq!(stored.reason, DeadLetterReason::MalformedEvent);
    assert_eq!(stored.attempt_count(), 2);
    assert_eq!(stored.last_error(), Some("bad payload"));
    assert_eq!(stored.event, first.event);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_list_pages_and_remove(pool: PgPool) {
    let sink = PgDeadLetterSink::new(pool);
    let entries: Vec<_> = (1..=3)
        .map(|version| parked(version, DeadLetterReason::UnknownEntityType, "no applier"))
        .collect();
    for entry in &entries {
        sink.record(entry.clone()).await.unwrap();
    }

    let page = sink.list(0, 2).await.unwrap();
    let removed = sink.remove(entries[0].event_id()).await.unwrap();
    let removed_again = sink.remove(entries[0].event_id()).await.unwrap();

    assert_eq!(page.len(), 2);
    assert!(removed.is_some());
    assert!(removed_again.is_none());
    assert_eq!(sink.count().await.unwrap(), 2);
}

// --- version sequencer ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_sequencer_counts_per_entity(pool: PgPool) {
    let sequencer = PgVersionSequencer::new(pool);
    let other = LedgerKey::new(Source::AdminService, EntityType::Company, "C2");

    let first = sequencer.next_version(&c1()).await.unwrap();
    let second = sequencer.next_version(&c1()).await.unwrap();
    let unrelated = sequencer.next_version(&other).await.unwrap();

    assert_eq!((first, second, unrelated), (1, 2, 1));
}
