//! Typed replica shapes.
//!
//! A replica shape is the normalized, consumer-local form of an entity
//! owned by another service. Payloads are decoded leniently (camelCase field
//! names of the owning stores are accepted, unknown fields are ignored) and
//! re-serialized in the shape's own form before they are stored.

use replicator_core::error::ReplicationError;
use replicator_core::event::{ChangeEvent, EntityType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// An entity's replica representation.
pub trait ReplicaShape: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The entity type this shape replicates.
    const ENTITY_TYPE: EntityType;

    /// The entity's identifier; must equal the change event's key.
    fn id(&self) -> &str;

    /// Checks shape-level constraints beyond deserialization.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated constraint.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Decodes and validates the payload of an `UPDATE` event into `R`.
///
/// # Errors
///
/// Returns `ReplicationError::MalformedEvent` if the payload is missing,
/// cannot be deserialized, names another entity, or fails validation.
pub fn decode<R: ReplicaShape>(event: &ChangeEvent) -> Result<R, ReplicationError> {
    let payload = event
        .payload
        .as_ref()
        .ok_or_else(|| ReplicationError::malformed(event.event_id, "UPDATE carries no payload"))?;
    let shape: R = serde_json::from_value(payload.clone()).map_err(|e| {
        ReplicationError::malformed(
            event.event_id,
            format!("payload is not a valid {}: {e}", R::ENTITY_TYPE),
        )
    })?;
    if shape.id() != event.entity_key {
        return Err(ReplicationError::malformed(
            event.event_id,
            format!(
                "payload id {:?} does not match entity key {:?}",
                shape.id(),
                event.entity_key
            ),
        ));
    }
    shape
        .validate()
        .map_err(|reason| ReplicationError::malformed(event.event_id, reason))?;
    Ok(shape)
}

fn default_active() -> bool {
    true
}

fn require_text(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{field} must not be blank"))
    } else {
        Ok(())
    }
}

fn require_quantity(field: &str, quantity: f64) -> Result<(), String> {
    if quantity.is_finite() && quantity > 0.0 {
        Ok(())
    } else {
        Err(format!("{field} must be a positive quantity (got {quantity})"))
    }
}

/// Company master data from the admin store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyReplica {
    pub id: String,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl ReplicaShape for CompanyReplica {
    const ENTITY_TYPE: EntityType = EntityType::Company;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), String> {
        require_text("name", &self.name)
    }
}

#[derive(Debug, Deserialize)]
struct CompanyRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    id: String,
    #[serde(alias = "fullName")]
    full_name: String,
    email: String,
    #[serde(default = "default_active")]
    active: bool,
    #[serde(default, alias = "companyId")]
    company_id: Option<String>,
    #[serde(default)]
    company: Option<CompanyRef>,
}

/// A user as seen by consumers. Credentials of the owning store are never
/// part of the replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "UserPayload")]
pub struct UserReplica {
    pub id: String,
    pub company_id: Option<String>,
    pub full_name: String,
    pub email: String,
    pub active: bool,
}

impl From<UserPayload> for UserReplica {
    fn from(payload: UserPayload) -> Self {
        Self {
            id: payload.id,
            company_id: payload
                .company_id
                .or_else(|| payload.company.map(|company| company.id)),
            full_name: payload.full_name,
            email: payload.email,
            active: payload.active,
        }
    }
}

impl ReplicaShape for UserReplica {
    const ENTITY_TYPE: EntityType = EntityType::User;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), String> {
        require_text("full_name", &self.full_name)?;
        if !self.email.contains('@') {
            return Err(format!("email {:?} is not an address", self.email));
        }
        Ok(())
    }
}

/// An element consumed by a formula or product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentLine {
    #[serde(alias = "elementId")]
    pub element_id: String,
    pub quantity: f64,
}

/// A formula used by a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaLine {
    #[serde(alias = "formulaId")]
    pub formula_id: String,
    pub quantity: f64,
}

/// A raw element from the products store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementReplica {
    pub id: String,
    #[serde(default, alias = "companyId")]
    pub company_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl ReplicaShape for ElementReplica {
    const ENTITY_TYPE: EntityType = EntityType::Element;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), String> {
        require_text("name", &self.name)
    }
}

/// A formula and the elements it is made of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaReplica {
    pub id: String,
    #[serde(default, alias = "companyId")]
    pub company_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub elements: Vec<ComponentLine>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl ReplicaShape for FormulaReplica {
    const ENTITY_TYPE: EntityType = EntityType::Formula;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), String> {
        require_text("name", &self.name)?;
        for line in &self.elements {
            require_text("element_id", &line.element_id)?;
            require_quantity("element quantity", line.quantity)?;
        }
        Ok(())
    }
}

/// A product with its element and formula composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductReplica {
    pub id: String,
    #[serde(default, alias = "companyId")]
    pub company_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub elements: Vec<ComponentLine>,
    #[serde(default)]
    pub formulas: Vec<FormulaLine>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl ReplicaShape for ProductReplica {
    const ENTITY_TYPE: EntityType = EntityType::Product;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), String> {
        require_text("name", &self.name)?;
        for line in &self.elements {
            require_quantity("element quantity", line.quantity)?;
        }
        for line in &self.formulas {
            require_quantity("formula quantity", line.quantity)?;
        }
        Ok(())
    }
}
