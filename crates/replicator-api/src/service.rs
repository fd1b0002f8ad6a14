//! Wiring of the replication pipeline into one running service.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use replicator_consumer::application::dispatcher::InboundDispatcher;
use replicator_consumer::application::reconciler::Reconciler;
use replicator_consumer::application::registry::ApplierRegistry;
use replicator_core::channel::ReplicationChannel;
use replicator_core::clock::Clock;
use replicator_core::dead_letter::DeadLetterSink;
use replicator_core::error::ReplicationError;
use replicator_core::ledger::{IdempotencyLedger, ReplicaStore};
use replicator_core::versioning::VersionSequencer;
use replicator_publisher::application::publisher::OutboundPublisher;
use replicator_store::pg_channel::PgChannel;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ReplicatorConfig;
use crate::routes;
use crate::state::AppState;

/// Storage and transport the service runs on.
pub struct Backends {
    pub channel: Arc<dyn ReplicationChannel>,
    pub store: Arc<dyn ReplicaStore>,
    pub ledger: Arc<dyn IdempotencyLedger>,
    pub sink: Arc<dyn DeadLetterSink>,
    pub sequencer: Arc<dyn VersionSequencer>,
}

/// A fully wired replicator: HTTP state, partition workers and the
/// retention sweep.
pub struct Service {
    state: AppState,
    dispatcher: Arc<InboundDispatcher>,
    clock: Arc<dyn Clock>,
    owned_partitions: Vec<u32>,
    retention: chrono::Duration,
    sweep_interval: Duration,
    channel_log: Option<PgChannel>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("owned_partitions", &self.owned_partitions)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl Service {
    /// Wires publisher, dispatcher and reconciler over `backends`.
    #[must_use]
    pub fn assemble(config: &ReplicatorConfig, backends: Backends, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(ApplierRegistry::standard(
            &backends.store,
            config.delete_policy,
            &config.entities,
        ));
        let publisher = OutboundPublisher::new(backends.channel.clone(), config.publish_retry())
            .with_clock(clock.clone());
        let dispatcher = InboundDispatcher::new(
            backends.channel,
            registry.clone(),
            backends.sink.clone(),
            config.apply_retry(),
        )
        .with_clock(clock.clone());
        let reconciler =
            Reconciler::new(backends.sink, registry.clone()).with_clock(clock.clone());

        let state = AppState {
            publisher: Arc::new(publisher),
            sequencer: backends.sequencer,
            store: backends.store,
            ledger: backends.ledger,
            registry,
            reconciler: Arc::new(reconciler),
        };

        Self {
            state,
            dispatcher: Arc::new(dispatcher),
            clock,
            owned_partitions: config.owned_partitions(),
            retention: config.ledger_retention(),
            sweep_interval: config.retention_sweep_interval(),
            channel_log: None,
        }
    }

    /// Also prunes acknowledged batches from a durable channel log on every
    /// retention sweep.
    #[must_use]
    pub fn with_channel_log(mut self, channel: PgChannel) -> Self {
        self.channel_log = Some(channel);
        self
    }

    /// Shared request state.
    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// The HTTP application: every route plus tracing and CORS layers.
    // TODO: Replace CorsLayer::permissive() with restricted origins for production.
    pub fn router(&self) -> Router {
        routes::router()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Starts one dispatcher worker per owned partition.
    pub fn spawn_workers(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(partitions = ?self.owned_partitions, "starting partition workers");
        self.dispatcher.spawn_workers(&self.owned_partitions, shutdown)
    }

    /// Runs one retention sweep.
    ///
    /// # Errors
    ///
    /// Returns the ledger's error if tombstones cannot be purged.
    pub async fn sweep_once(&self) -> Result<u64, ReplicationError> {
        let cutoff = self.clock.cutoff(self.retention);
        let purged = self.state.ledger.purge_tombstones_before(cutoff).await?;
        if purged > 0 {
            info!(purged, %cutoff, "purged expired ledger tombstones");
        }
        if let Some(channel) = &self.channel_log {
            let pruned = channel.prune_delivered().await?;
            if pruned > 0 {
                info!(pruned, "pruned acknowledged batches from the replication log");
            }
        }
        Ok(purged)
    }

    /// Runs the retention sweep periodically until shutdown.
    pub fn spawn_retention_sweep(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.sweep_interval);
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = service.sweep_once().await {
                            warn!(error = %err, "retention sweep failed");
                        }
                    }
                }
            }
        })
    }
}
