//! Replicator service entry point.

use std::sync::Arc;

use replicator_api::config::{ChannelKind, ReplicatorConfig};
use replicator_api::error::AppError;
use replicator_api::service::{Backends, Service};
use replicator_api::telemetry;
use replicator_channel::MemoryChannel;
use replicator_core::channel::ReplicationChannel;
use replicator_core::clock::SystemClock;
use replicator_store::pg_channel::PgChannel;
use replicator_store::pg_dead_letter_sink::PgDeadLetterSink;
use replicator_store::pg_replica_store::PgReplicaStore;
use replicator_store::pg_version_sequencer::PgVersionSequencer;
use replicator_store::schema::MIGRATOR;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let telemetry = telemetry::init()?;

    tracing::info!("Starting replicator");

    let config = ReplicatorConfig::load()?;

    // Create database connection pool and bring the schema up to date.
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(config.database_url()?)
        .await?;
    MIGRATOR.run(&pool).await?;

    let store = Arc::new(PgReplicaStore::new(pool.clone()));
    let pg_channel = PgChannel::new(pool.clone(), config.consumer_group.clone(), config.partitions)
        .with_lease(config.lease())
        .with_poll_interval(config.poll_interval());
    let channel: Arc<dyn ReplicationChannel> = match config.channel {
        ChannelKind::Postgres => Arc::new(pg_channel.clone()),
        ChannelKind::Memory => Arc::new(MemoryChannel::new(config.partitions)),
    };
    let backends = Backends {
        channel,
        store: store.clone(),
        ledger: store,
        sink: Arc::new(PgDeadLetterSink::new(pool.clone())),
        sequencer: Arc::new(PgVersionSequencer::new(pool)),
    };

    let mut service = Service::assemble(&config, backends, Arc::new(SystemClock));
    if config.channel == ChannelKind::Postgres {
        service = service.with_channel_log(pg_channel);
    }
    let service = Arc::new(service);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = service.spawn_workers(&shutdown_rx);
    let sweep = service.spawn_retention_sweep(shutdown_rx);

    // Start server.
    let addr = config.bind_address()?;
    tracing::info!(%addr, channel = ?config.channel, "Listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, service.router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Workers finish the batch in hand before stopping.
    if shutdown_tx.send(true).is_err() {
        tracing::warn!("no worker was listening for shutdown");
    }
    for handle in workers.into_iter().chain(std::iter::once(sweep)) {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "background task failed");
        }
    }

    tracing::info!("Replicator stopped");
    telemetry.shutdown();
    Ok(())
}
