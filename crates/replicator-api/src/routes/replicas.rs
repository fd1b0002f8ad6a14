//! Operator route for replica inspection.

use axum::extract::{Path, State};
use axum::{Json, Router, routing::get};
use replicator_consumer::application::query_handlers;
use replicator_core::ledger::ReplicaRecord;

use crate::error::ApiError;
use crate::routes::ledger_key;
use crate::state::AppState;

/// GET /api/v1/replicas/{source}/{entity_type}/{entity_key}
///
/// Tombstones are returned with `deleted_at` set.
async fn get_replica(
    State(state): State<AppState>,
    Path(segments): Path<(String, String, String)>,
) -> Result<Json<ReplicaRecord>, ApiError> {
    let key = ledger_key(segments)?;
    query_handlers::get_replica(&key, state.store.as_ref())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no replica for {key}")))
}

/// Returns the replica router.
pub fn router() -> Router<AppState> {
    Router::new().route(
        "/api/v1/replicas/{source}/{entity_type}/{entity_key}",
        get(get_replica),
    )
}
