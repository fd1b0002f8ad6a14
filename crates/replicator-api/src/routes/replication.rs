//! Change ingestion: owning services post the changes of one committed
//! transaction, which are published as one batch.

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Json, Router, routing::post};
use replicator_core::event::{EntityType, Process, Source};
use replicator_publisher::application::command_handlers;
use replicator_publisher::domain::commands::{PublishChange, PublishTransaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Request body for POST /api/v1/replication.
#[derive(Debug, Deserialize)]
pub struct ReplicationRequest {
    /// Changes in commit order.
    #[serde(alias = "messageList")]
    pub message_list: Vec<ReplicationMessage>,
}

/// One change of the posted transaction.
#[derive(Debug, Deserialize)]
pub struct ReplicationMessage {
    pub source: Source,
    pub process: Process,
    #[serde(alias = "entityType")]
    pub entity_type: EntityType,
    /// Defaults to the payload's `id`.
    #[serde(default, alias = "entityKey")]
    pub entity_key: Option<String>,
    /// Stamped by the version sequencer when absent.
    #[serde(default)]
    pub version: Option<i64>,
    /// Entity snapshot, as a JSON object or as a string holding one.
    #[serde(default, alias = "jsonData", alias = "json_data")]
    pub payload: Option<Value>,
}

/// One published event.
#[derive(Debug, Serialize)]
pub struct PublishedEvent {
    pub event_id: Uuid,
    pub version: i64,
}

/// Response body returned once the channel accepted the batch.
#[derive(Debug, Serialize)]
pub struct ReplicationResponse {
    pub correlation_id: Uuid,
    pub batch_id: Uuid,
    pub partition: u32,
    pub events: Vec<PublishedEvent>,
}

impl ReplicationMessage {
    fn into_change(self, index: usize) -> Result<PublishChange, ApiError> {
        let payload = match self.payload {
            Some(Value::String(text)) => Some(serde_json::from_str(&text).map_err(|e| {
                ApiError::BadRequest(format!("message {index}: payload is not valid JSON: {e}"))
            })?),
            Some(Value::Null) | None => None,
            Some(value) => Some(value),
        };
        let entity_key = match self.entity_key {
            Some(key) => key,
            None => match payload.as_ref().and_then(|p| p.get("id")) {
                Some(Value::String(id)) => id.clone(),
                Some(Value::Number(id)) => id.to_string(),
                _ => {
                    return Err(ApiError::BadRequest(format!(
                        "message {index}: entity_key is missing and the payload has no id"
                    )));
                }
            },
        };

        Ok(PublishChange {
            source: self.source,
            process: self.process,
            entity_type: self.entity_type,
            entity_key,
            version: self.version,
            payload,
        })
    }
}

/// POST /api/v1/replication
#[instrument(skip(state, request), fields(messages = request.message_list.len()))]
async fn replicate(
    State(state): State<AppState>,
    Json(request): Json<ReplicationRequest>,
) -> Result<(StatusCode, Json<ReplicationResponse>), ApiError> {
    let Some(source) = request.message_list.first().map(|message| message.source) else {
        return Err(ApiError::BadRequest("message_list must not be empty".into()));
    };
    let changes = request
        .message_list
        .into_iter()
        .enumerate()
        .map(|(index, message)| message.into_change(index))
        .collect::<Result<Vec<_>, _>>()?;

    let command = PublishTransaction {
        correlation_id: Uuid::new_v4(),
        source,
        changes,
    };

    info!(correlation_id = %command.correlation_id, %source, "handling replication request");

    let published = command_handlers::handle_publish_transaction(
        &command,
        state.sequencer.as_ref(),
        &state.publisher,
    )
    .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ReplicationResponse {
            correlation_id: command.correlation_id,
            batch_id: published.batch_id,
            partition: published.partition,
            events: published
                .events
                .into_iter()
                .map(|(event_id, version)| PublishedEvent { event_id, version })
                .collect(),
        }),
    ))
}

/// Returns the ingestion router.
pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/replication", post(replicate))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::Request;
    use replicator_core::channel::ReplicationChannel;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::service::tests::service_with_doubles;

    fn post(body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/replication")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    async fn json_of(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_replicate_publishes_one_batch_with_stamped_versions() {
        // Arrange
        let (service, doubles) = service_with_doubles();
        let body = json!({
            "message_list": [
                { "source": "API_ADMIN", "process": "UPDATE", "entity_type": "Company",
                  "payload": { "id": "C1", "name": "Acme" } },
                { "source": "API_ADMIN", "process": "UPDATE", "entity_type": "Company",
                  "payload": { "id": "C1", "name": "Acme Corp" } }
            ]
        });

        // Act
        let response = service.router().oneshot(post(&body)).await.unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = json_of(response).await;
        let events = json["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["version"], 1);
        assert_eq!(events[1]["version"], 2);

        let partition = u32::try_from(json["partition"].as_u64().unwrap()).unwrap();
        assert_eq!(doubles.channel.queued(partition), 1);
        let delivery = doubles.channel.receive(partition).await.unwrap();
        assert_eq!(delivery.batch.events[1].entity_key, "C1");
        assert_eq!(delivery.batch.events[1].payload.as_ref().unwrap()["name"], "Acme Corp");
    }

    #[tokio::test]
    async fn test_replicate_accepts_camel_case_string_payload() {
        let (service, doubles) = service_with_doubles();
        let body = json!({
            "messageList": [
                { "source": "API_PRODUCTS", "process": "UPDATE", "entityType": "Element",
                  "version": 7, "jsonData": "{\"id\":\"E1\",\"name\":\"Flour\"}" }
            ]
        });

        let response = service.router().oneshot(post(&body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = json_of(response).await;
        assert_eq!(json["events"][0]["version"], 7);
        let partition = u32::try_from(json["partition"].as_u64().unwrap()).unwrap();
        let delivery = doubles.channel.receive(partition).await.unwrap();
        assert_eq!(delivery.batch.events[0].entity_key, "E1");
    }

    #[tokio::test]
    async fn test_replicate_rejects_mixed_sources() {
        let (service, _) = service_with_doubles();
        let body = json!({
            "message_list": [
                { "source": "API_ADMIN", "process": "DELETE",
                  "entity_type": "User", "entity_key": "U1" },
                { "source": "API_PRODUCTS", "process": "DELETE",
                  "entity_type": "Product", "entity_key": "P1" }
            ]
        });

        let response = service.router().oneshot(post(&body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_of(response).await["error"], "invalid_batch");
    }

    #[tokio::test]
    async fn test_replicate_rejects_empty_message_list() {
        let (service, _) = service_with_doubles();

        let response = service
            .router()
            .oneshot(post(&json!({ "message_list": [] })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_of(response).await["error"], "bad_request");
    }

    #[tokio::test]
    async fn test_replicate_requires_entity_key_or_payload_id() {
        let (service, _) = service_with_doubles();
        let body = json!({
            "message_list": [
                { "source": "API_ADMIN", "process": "UPDATE", "entity_type": "Company",
                  "payload": { "name": "Nameless" } }
            ]
        });

        let response = service.router().oneshot(post(&body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_replicate_returns_422_for_unknown_entity_type() {
        let (service, _) = service_with_doubles();
        let body = json!({
            "message_list": [
                { "source": "API_ADMIN", "process": "DELETE",
                  "entity_type": "Invoice", "entity_key": "I1" }
            ]
        });

        let response = service.router().oneshot(post(&body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
