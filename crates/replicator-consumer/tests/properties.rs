//! Property tests for idempotent, order-tolerant application.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use replicator_consumer::application::applier::{DeletePolicy, EntityApplier, ReplicaApplier};
use replicator_consumer::domain::replicas::CompanyReplica;
use replicator_core::clock::Clock;
use replicator_core::event::{ChangeEvent, EntityType, Source};
use replicator_core::ledger::{IdempotencyLedger, LedgerEntry, LedgerKey, ReplicaRecord};
use replicator_test_support::{FixedClock, InMemoryReplicaStore};
use serde_json::json;

/// `(version, is_delete)` pairs with distinct versions, ascending.
fn history() -> impl Strategy<Value = Vec<(i64, bool)>> {
    prop::collection::btree_map(1i64..64, any::<bool>(), 1..12)
        .prop_map(|ops| ops.into_iter().collect())
}

fn event(version: i64, is_delete: bool, clock: &dyn Clock) -> ChangeEvent {
    if is_delete {
        ChangeEvent::delete(Source::AdminService, EntityType::Company, "C1", version, clock)
    } else {
        ChangeEvent::update(
            Source::AdminService,
            EntityType::Company,
            "C1",
            version,
            json!({ "id": "C1", "name": format!("Acme v{version}") }),
            clock,
        )
    }
}

fn replay(
    arrivals: &[(i64, bool)],
    policy: DeletePolicy,
) -> (Vec<ReplicaRecord>, Option<LedgerEntry>, usize) {
    let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()));
    let store = Arc::new(InMemoryReplicaStore::with_clock(clock.clone()));
    let applier: EntityApplier<CompanyReplica> = EntityApplier::new(store.clone(), policy);
    let key = LedgerKey::new(Source::AdminService, EntityType::Company, "C1");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    runtime.block_on(async {
        for &(version, is_delete) in arrivals {
            applier
                .apply(&event(version, is_delete, clock.as_ref()))
                .await
                .unwrap();
        }
        let entry = store.entry(&key).await.unwrap();
        (store.records(), entry, store.mutation_count())
    })
}

fn policy() -> impl Strategy<Value = DeletePolicy> {
    prop_oneof![Just(DeletePolicy::Remove), Just(DeletePolicy::Tombstone)]
}

proptest! {
    #[test]
    fn any_arrival_order_converges_to_in_order_state(
        (ordered, shuffled) in history()
            .prop_flat_map(|ops| (Just(ops.clone()), Just(ops).prop_shuffle())),
        policy in policy(),
    ) {
        let (records_in_order, ledger_in_order, _) = replay(&ordered, policy);
        let (records_shuffled, ledger_shuffled, _) = replay(&shuffled, policy);

        let max_version = ordered.iter().map(|(version, _)| *version).max();
        prop_assert_eq!(ledger_shuffled.as_ref().map(|entry| entry.version), max_version);
        prop_assert_eq!(ledger_shuffled, ledger_in_order);
        if policy == DeletePolicy::Remove {
            prop_assert_eq!(records_shuffled, records_in_order);
        } else {
            // A tombstone keeps whatever document preceded it, which depends
            // on arrival order; liveness and version do not.
            let summary = |records: &[ReplicaRecord]| {
                records
                    .iter()
                    .map(|record| (record.version, record.is_tombstone()))
                    .collect::<Vec<_>>()
            };
            prop_assert_eq!(summary(&records_shuffled), summary(&records_in_order));
        }
    }

    #[test]
    fn redelivery_never_mutates_twice(
        ops in history(),
        repeats in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let mut arrivals = ops.clone();
        arrivals.extend(repeats.iter().map(|index| ops[index.index(ops.len())]));

        let (records_once, ledger_once, mutations_once) = replay(&ops, DeletePolicy::Remove);
        let (records_repeated, ledger_repeated, mutations_repeated) =
            replay(&arrivals, DeletePolicy::Remove);

        prop_assert_eq!(records_repeated, records_once);
        prop_assert_eq!(ledger_repeated, ledger_once);
        prop_assert_eq!(mutations_repeated, mutations_once);
    }

    #[test]
    fn deleted_key_is_never_resurrected_by_older_update(
        delete_version in 2i64..64,
        late_version in 1i64..64,
    ) {
        let late_version = late_version.min(delete_version);
        let arrivals = [(delete_version, true), (late_version, false)];

        let (records, ledger, _) = replay(&arrivals, DeletePolicy::Remove);

        prop_assert!(records.is_empty());
        let ledger = ledger.unwrap();
        prop_assert_eq!(ledger.version, delete_version);
        prop_assert!(ledger.deleted);
    }
}
