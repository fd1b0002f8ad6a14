//! HTTP routes: change ingestion and the operator interface.

pub mod dead_letters;
pub mod health;
pub mod ledger;
pub mod replicas;
pub mod replication;

use axum::Router;
use replicator_core::ledger::LedgerKey;

use crate::error::ApiError;
use crate::state::AppState;

/// Every route of the service.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(replication::router())
        .merge(dead_letters::router())
        .merge(ledger::router())
        .merge(replicas::router())
}

/// Parses the `{source}/{entity_type}/{entity_key}` path segments.
pub(crate) fn ledger_key(
    (source, entity_type, entity_key): (String, String, String),
) -> Result<LedgerKey, ApiError> {
    Ok(LedgerKey::new(
        source.parse()?,
        entity_type.parse()?,
        entity_key,
    ))
}
