//! Operator route for idempotency ledger inspection.

use axum::extract::{Path, State};
use axum::{Json, Router, routing::get};
use replicator_consumer::application::query_handlers;
use replicator_core::ledger::LedgerEntry;

use crate::error::ApiError;
use crate::routes::ledger_key;
use crate::state::AppState;

/// GET /api/v1/ledger/{source}/{entity_type}/{entity_key}
async fn get_ledger_entry(
    State(state): State<AppState>,
    Path(segments): Path<(String, String, String)>,
) -> Result<Json<LedgerEntry>, ApiError> {
    let key = ledger_key(segments)?;
    query_handlers::get_ledger_entry(&key, state.ledger.as_ref())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no ledger entry for {key}")))
}

/// Returns the ledger router.
pub fn router() -> Router<AppState> {
    Router::new().route(
        "/api/v1/ledger/{source}/{entity_type}/{entity_key}",
        get(get_ledger_entry),
    )
}
