//! Replicator — API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use replicator_core::error::{ParseEnumError, ReplicationError};
use serde::Serialize;
use thiserror::Error;

/// Startup and runtime errors for the service.
#[derive(Debug, Error)]
pub enum AppError {
    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database connection or pool error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Tracing or exporter setup failed.
    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// Network binding or I/O error.
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// JSON body returned for error responses.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code.
    pub error: &'static str,
    /// Human-readable error message.
    pub message: String,
}

/// HTTP-layer error that implements `IntoResponse`.
#[derive(Debug)]
pub enum ApiError {
    /// A replication operation failed.
    Replication(ReplicationError),
    /// The request is not well formed.
    BadRequest(String),
    /// The addressed resource does not exist.
    NotFound(String),
}

impl From<ReplicationError> for ApiError {
    fn from(err: ReplicationError) -> Self {
        Self::Replication(err)
    }
}

impl From<ParseEnumError> for ApiError {
    fn from(err: ParseEnumError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Replication(err) => match err {
                ReplicationError::DeadLetterNotFound(_) => {
                    (StatusCode::NOT_FOUND, "dead_letter_not_found")
                }
                ReplicationError::InvalidBatch(_) => (StatusCode::BAD_REQUEST, "invalid_batch"),
                ReplicationError::MalformedEvent { .. } => {
                    (StatusCode::BAD_REQUEST, "malformed_event")
                }
                ReplicationError::UnknownEntityType(_) => {
                    (StatusCode::BAD_REQUEST, "unknown_entity_type")
                }
                ReplicationError::TransportFailure(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "transport_failure")
                }
                ReplicationError::StoreUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
                }
            },
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();
        let message = match self {
            ApiError::Replication(err) => err.to_string(),
            ApiError::BadRequest(message) | ApiError::NotFound(message) => message,
        };
        if status.is_server_error() {
            tracing::warn!(error = error_code, %message, "request failed");
        }

        (
            status,
            Json(ErrorBody {
                error: error_code,
                message,
            }),
        )
            .into_response()
    }
}
