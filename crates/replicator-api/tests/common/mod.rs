//! Shared test helpers for API integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::TimeZone;
use http_body_util::BodyExt;
use replicator_api::config::ReplicatorConfig;
use replicator_api::service::{Backends, Service};
use replicator_channel::MemoryChannel;
use replicator_core::clock::Clock;
use replicator_core::ledger::{IdempotencyLedger, LedgerKey};
use replicator_store::pg_dead_letter_sink::PgDeadLetterSink;
use replicator_store::pg_replica_store::PgReplicaStore;
use replicator_store::pg_version_sequencer::PgVersionSequencer;
use replicator_test_support::{
    FixedClock, InMemoryDeadLetterSink, InMemoryReplicaStore, InMemoryVersionSequencer,
};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceExt;

/// Fixed timestamp used across all integration tests.
pub fn fixed_clock() -> Arc<dyn Clock> {
    Arc::new(FixedClock(
        chrono::Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
    ))
}

/// Configuration with fast, short retries.
pub fn test_config() -> ReplicatorConfig {
    ReplicatorConfig {
        partitions: 4,
        publish_max_attempts: 2,
        apply_max_attempts: 2,
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 2,
        ..ReplicatorConfig::default()
    }
}

/// A service running entirely in memory, with handles on its backends.
pub struct MemoryHarness {
    pub service: Arc<Service>,
    pub channel: Arc<MemoryChannel>,
    pub store: Arc<InMemoryReplicaStore>,
    pub sink: Arc<InMemoryDeadLetterSink>,
}

pub fn memory_harness() -> MemoryHarness {
    let channel = Arc::new(MemoryChannel::new(4));
    let store = Arc::new(InMemoryReplicaStore::with_clock(fixed_clock()));
    let sink = Arc::new(InMemoryDeadLetterSink::new());
    let backends = Backends {
        channel: channel.clone(),
        store: store.clone(),
        ledger: store.clone(),
        sink: sink.clone(),
        sequencer: Arc::new(InMemoryVersionSequencer::new()),
    };
    MemoryHarness {
        service: Arc::new(Service::assemble(&test_config(), backends, fixed_clock())),
        channel,
        store,
        sink,
    }
}

/// A service storing replicas, ledger and dead letters in `PostgreSQL`,
/// with an in-memory channel.
pub fn pg_service(pool: PgPool) -> (Arc<Service>, Arc<MemoryChannel>) {
    let channel = Arc::new(MemoryChannel::new(4));
    let store = Arc::new(PgReplicaStore::with_clock(pool.clone(), fixed_clock()));
    let backends = Backends {
        channel: channel.clone(),
        store: store.clone(),
        ledger: store,
        sink: Arc::new(PgDeadLetterSink::new(pool.clone())),
        sequencer: Arc::new(PgVersionSequencer::new(pool)),
    };
    let service = Service::assemble(&test_config(), backends, fixed_clock());
    (Arc::new(service), channel)
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body_bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap()
    };

    (status, json)
}

/// Send a POST request with a JSON body and return the response.
pub async fn post_json(
    app: Router,
    uri: &str,
    body: &serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();
    send(app, request).await
}

/// Send a POST request without a body and return the response.
pub async fn post_empty(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

/// Send a DELETE request and return the response.
pub async fn send_delete(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

/// Send a GET request and return the response.
pub async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

/// Waits up to a second for the ledger of `key` to reach `version`.
pub async fn wait_for_version(
    ledger: &dyn IdempotencyLedger,
    key: &LedgerKey,
    version: i64,
) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if ledger.version(key).await.unwrap() == Some(version) {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    false
}

/// Starts the service's partition workers; stop them with [`stop_workers`].
pub fn start_workers(service: &Service) -> (watch::Sender<bool>, Vec<JoinHandle<()>>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = service.spawn_workers(&shutdown_rx);
    (shutdown_tx, handles)
}

pub async fn stop_workers(shutdown: watch::Sender<bool>, handles: Vec<JoinHandle<()>>) {
    shutdown.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
