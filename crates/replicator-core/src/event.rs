//! Change events and batches: the unit of replication on the wire.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ParseEnumError, ReplicationError};
use crate::ledger::LedgerKey;
use crate::partition::PartitionKey;

/// Longest entity key, in characters, the ledger and replica tables hold.
pub const MAX_ENTITY_KEY_LEN: usize = 255;

/// The owning service that produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Source {
    /// Owner of Company and User masters.
    #[serde(rename = "API_ADMIN")]
    AdminService,
    /// Owner of Product, Element and Formula data.
    #[serde(rename = "API_PRODUCTS")]
    ProductsService,
    /// Owner of order data.
    #[serde(rename = "API_ORDERS")]
    OrdersService,
}

impl Source {
    /// Every known source.
    pub const ALL: [Source; 3] = [
        Source::AdminService,
        Source::ProductsService,
        Source::OrdersService,
    ];

    /// Wire name of the source.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Source::AdminService => "API_ADMIN",
            Source::ProductsService => "API_PRODUCTS",
            Source::OrdersService => "API_ORDERS",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Source::ALL
            .into_iter()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "source",
                value: s.to_owned(),
            })
    }
}

/// The kind of mutation a change event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Process {
    /// Create-or-replace with the full entity snapshot.
    #[serde(rename = "UPDATE")]
    Update,
    /// Remove the entity.
    #[serde(rename = "DELETE")]
    Delete,
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Process::Update => "UPDATE",
            Process::Delete => "DELETE",
        })
    }
}

/// Logical entity names that can be replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    /// A company master record.
    Company,
    /// A user belonging to a company.
    User,
    /// A sellable product.
    Product,
    /// A raw element consumed by formulas and products.
    Element,
    /// A formula composed of elements.
    Formula,
}

impl EntityType {
    /// Every known entity type.
    pub const ALL: [EntityType; 5] = [
        EntityType::Company,
        EntityType::User,
        EntityType::Product,
        EntityType::Element,
        EntityType::Formula,
    ];

    /// Name of the entity type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Company => "Company",
            EntityType::User => "User",
            EntityType::Product => "Product",
            EntityType::Element => "Element",
            EntityType::Formula => "Formula",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|entity_type| entity_type.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseEnumError {
                kind: "entity type",
                value: s.to_owned(),
            })
    }
}

/// One logical mutation of one entity instance.
///
/// Immutable once published. `payload` is the full entity snapshot for
/// `UPDATE` and absent for `DELETE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// The owning service.
    pub source: Source,
    /// Mutation kind.
    pub process: Process,
    /// Logical entity name; selects the replica applier.
    pub entity_type: EntityType,
    /// Stable identifier of the entity within `(source, entity_type)`.
    pub entity_key: String,
    /// Strictly increasing per `(source, entity_type, entity_key)`.
    pub version: i64,
    /// Serialized entity state at mutation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Producer timestamp.
    pub occurred_at: DateTime<Utc>,
    /// Correlation ID of the originating request.
    pub correlation_id: Uuid,
}

impl ChangeEvent {
    /// Builds an `UPDATE` event carrying the entity snapshot.
    pub fn update(
        source: Source,
        entity_type: EntityType,
        entity_key: impl Into<String>,
        version: i64,
        payload: serde_json::Value,
        clock: &dyn Clock,
    ) -> Self {
        Self::new(
            source,
            Process::Update,
            entity_type,
            entity_key.into(),
            version,
            Some(payload),
            clock,
        )
    }

    /// Builds a `DELETE` event.
    pub fn delete(
        source: Source,
        entity_type: EntityType,
        entity_key: impl Into<String>,
        version: i64,
        clock: &dyn Clock,
    ) -> Self {
        Self::new(
            source,
            Process::Delete,
            entity_type,
            entity_key.into(),
            version,
            None,
            clock,
        )
    }

    /// Builds an event of either kind. A `DELETE` never carries a payload,
    /// so one passed here is dropped.
    pub fn new(
        source: Source,
        process: Process,
        entity_type: EntityType,
        entity_key: String,
        version: i64,
        payload: Option<serde_json::Value>,
        clock: &dyn Clock,
    ) -> Self {
        let correlation_id = Uuid::now_v7();
        let payload = match process {
            Process::Update => payload,
            Process::Delete => None,
        };
        Self {
            event_id: Uuid::now_v7(),
            source,
            process,
            entity_type,
            entity_key,
            version,
            payload,
            occurred_at: clock.now(),
            correlation_id,
        }
    }

    /// Replaces the correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// The idempotency ledger key this event advances.
    #[must_use]
    pub fn ledger_key(&self) -> LedgerKey {
        LedgerKey::new(self.source, self.entity_type, self.entity_key.clone())
    }

    /// Checks the producer-side invariants of a publishable event.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::InvalidBatch` describing the first violation.
    pub fn validate(&self) -> Result<(), ReplicationError> {
        if self.entity_key.trim().is_empty() {
            return Err(ReplicationError::InvalidBatch(format!(
                "event {} has an empty entity key",
                self.event_id
            )));
        }
        if self.entity_key.chars().count() > MAX_ENTITY_KEY_LEN {
            return Err(ReplicationError::InvalidBatch(format!(
                "event {} has an entity key longer than {MAX_ENTITY_KEY_LEN} characters",
                self.event_id
            )));
        }
        if self.version < 1 {
            return Err(ReplicationError::InvalidBatch(format!(
                "event {} has no assigned version (got {})",
                self.event_id, self.version
            )));
        }
        if self.process == Process::Update && self.payload.is_none() {
            return Err(ReplicationError::InvalidBatch(format!(
                "UPDATE event {} carries no payload",
                self.event_id
            )));
        }
        Ok(())
    }
}

/// Ordered change events produced within one originating transaction.
///
/// Consumers may assume the events were consistent at the source when
/// published, but must not assume all-or-nothing application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Unique batch identifier.
    pub batch_id: Uuid,
    /// The owning service that produced every event in the batch.
    pub source: Source,
    /// Events in producer order.
    pub events: Vec<ChangeEvent>,
    /// When the batch was sealed.
    pub created_at: DateTime<Utc>,
}

impl Batch {
    /// Seals a batch, validating every event.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::InvalidBatch` if `events` is empty, an event
    /// fails validation, or an event belongs to another source.
    pub fn new(
        source: Source,
        events: Vec<ChangeEvent>,
        clock: &dyn Clock,
    ) -> Result<Self, ReplicationError> {
        let batch = Self {
            batch_id: Uuid::now_v7(),
            source,
            events,
            created_at: clock.now(),
        };
        batch.validate()?;
        Ok(batch)
    }

    /// Checks that the batch is publishable.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::InvalidBatch` describing the first violation.
    pub fn validate(&self) -> Result<(), ReplicationError> {
        if self.events.is_empty() {
            return Err(ReplicationError::InvalidBatch(format!(
                "batch {} contains no events",
                self.batch_id
            )));
        }
        for event in &self.events {
            if event.source != self.source {
                return Err(ReplicationError::InvalidBatch(format!(
                    "event {} from {} cannot travel in a {} batch",
                    event.event_id, event.source, self.source
                )));
            }
            event.validate()?;
        }
        Ok(())
    }

    /// Partition key of the batch: the first event's entity.
    #[must_use]
    pub fn partition_key(&self) -> Option<PartitionKey> {
        self.events
            .first()
            .map(|event| PartitionKey::new(event.entity_type, event.entity_key.clone()))
    }

    /// Number of events in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if the batch carries no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn company_update(key: &str, version: i64) -> ChangeEvent {
        ChangeEvent::update(
            Source::AdminService,
            EntityType::Company,
            key,
            version,
            serde_json::json!({ "id": key, "name": "Acme" }),
            &SystemClock,
        )
    }

    #[test]
    fn test_change_event_serializes_wire_names() {
        // Arrange
        let event = company_update("C1", 1);

        // Act
        let json = serde_json::to_value(&event).unwrap();

        // Assert
        assert_eq!(json["source"], "API_ADMIN");
        assert_eq!(json["process"], "UPDATE");
        assert_eq!(json["entity_type"], "Company");
        assert_eq!(json["entity_key"], "C1");
        assert_eq!(json["version"], 1);
        assert_eq!(json["payload"]["name"], "Acme");
    }

    #[test]
    fn test_delete_event_omits_payload() {
        let event = ChangeEvent::delete(
            Source::AdminService,
            EntityType::User,
            "U1",
            4,
            &SystemClock,
        );

        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["process"], "DELETE");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn test_validate_rejects_unassigned_version() {
        let event = company_update("C1", 0);

        let result = event.validate();

        match result {
            Err(ReplicationError::InvalidBatch(msg)) => assert!(msg.contains("version")),
            other => panic!("expected InvalidBatch, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_blank_key() {
        let event = company_update("  ", 1);

        assert!(matches!(
            event.validate(),
            Err(ReplicationError::InvalidBatch(_))
        ));
    }

    #[test]
    fn test_validate_bounds_key_length() {
        let longest = company_update(&"k".repeat(MAX_ENTITY_KEY_LEN), 1);
        let too_long = company_update(&"k".repeat(MAX_ENTITY_KEY_LEN + 1), 1);

        assert!(longest.validate().is_ok());
        assert!(matches!(
            too_long.validate(),
            Err(ReplicationError::InvalidBatch(_))
        ));
    }

    #[test]
    fn test_validate_rejects_update_without_payload() {
        let mut event = company_update("C1", 1);
        event.payload = None;

        assert!(matches!(
            event.validate(),
            Err(ReplicationError::InvalidBatch(_))
        ));
    }

    #[test]
    fn test_batch_rejects_empty_event_list() {
        let result = Batch::new(Source::AdminService, Vec::new(), &SystemClock);

        assert!(matches!(result, Err(ReplicationError::InvalidBatch(_))));
    }

    #[test]
    fn test_batch_rejects_foreign_source() {
        let mut event = company_update("C1", 1);
        event.source = Source::ProductsService;

        let result = Batch::new(Source::AdminService, vec![event], &SystemClock);

        assert!(matches!(result, Err(ReplicationError::InvalidBatch(_))));
    }

    #[test]
    fn test_batch_partition_key_uses_first_event() {
        let batch = Batch::new(
            Source::AdminService,
            vec![company_update("C1", 1), company_update("C2", 1)],
            &SystemClock,
        )
        .unwrap();

        let key = batch.partition_key().unwrap();

        assert_eq!(key.entity_type, EntityType::Company);
        assert_eq!(key.entity_key, "C1");
    }

    #[test]
    fn test_enums_parse_from_wire_names() {
        assert_eq!("API_PRODUCTS".parse::<Source>().unwrap(), Source::ProductsService);
        assert_eq!("company".parse::<EntityType>().unwrap(), EntityType::Company);
        assert!("API_BILLING".parse::<Source>().is_err());
        assert!("Invoice".parse::<EntityType>().is_err());
    }
}
