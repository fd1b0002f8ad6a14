//! Operator routes for dead-letter reconciliation.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Json, Router, routing::get, routing::post};
use chrono::{DateTime, Utc};
use replicator_consumer::application::reconciler::ReprocessOutcome;
use replicator_core::dead_letter::{DeadLetterEntry, DeadLetterReason};
use replicator_core::event::{EntityType, Source};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_LIMIT: u64 = 50;
const MAX_LIMIT: u64 = 500;

/// Query parameters for GET /api/v1/dead-letters.
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

/// One dead-letter entry in a listing.
#[derive(Debug, Serialize)]
pub struct DeadLetterSummary {
    pub event_id: Uuid,
    pub batch_id: Uuid,
    pub source: Source,
    pub entity_type: EntityType,
    pub entity_key: String,
    pub version: i64,
    pub reason: DeadLetterReason,
    pub attempt_count: usize,
    pub last_error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl From<&DeadLetterEntry> for DeadLetterSummary {
    fn from(entry: &DeadLetterEntry) -> Self {
        Self {
            event_id: entry.event_id(),
            batch_id: entry.batch_id,
            source: entry.event.source,
            entity_type: entry.event.entity_type,
            entity_key: entry.event.entity_key.clone(),
            version: entry.event.version,
            reason: entry.reason,
            attempt_count: entry.attempt_count(),
            last_error: entry.last_error().map(str::to_owned),
            recorded_at: entry.recorded_at,
        }
    }
}

/// Response body for GET /api/v1/dead-letters.
#[derive(Debug, Serialize)]
pub struct DeadLetterListResponse {
    pub entries: Vec<DeadLetterSummary>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

/// GET /api/v1/dead-letters
async fn list_dead_letters(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<DeadLetterListResponse>, ApiError> {
    let offset = params.offset.unwrap_or(0);
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let page = state.reconciler.list(offset, limit).await?;

    Ok(Json(DeadLetterListResponse {
        entries: page.entries.iter().map(DeadLetterSummary::from).collect(),
        total: page.total,
        offset,
        limit,
    }))
}

/// GET /api/v1/dead-letters/{event_id}
async fn get_dead_letter(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Result<Json<DeadLetterEntry>, ApiError> {
    Ok(Json(state.reconciler.get(event_id).await?))
}

/// POST /api/v1/dead-letters/{event_id}/reprocess
#[instrument(skip(state))]
async fn reprocess_dead_letter(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Result<Json<ReprocessOutcome>, ApiError> {
    info!("handling reprocess request");
    Ok(Json(state.reconciler.reprocess(event_id).await?))
}

/// DELETE /api/v1/dead-letters/{event_id}
#[instrument(skip(state))]
async fn discard_dead_letter(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.reconciler.discard(event_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Returns the dead-letter router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/dead-letters", get(list_dead_letters))
        .route(
            "/api/v1/dead-letters/{event_id}",
            get(get_dead_letter).delete(discard_dead_letter),
        )
        .route(
            "/api/v1/dead-letters/{event_id}/reprocess",
            post(reprocess_dead_letter),
        )
}
