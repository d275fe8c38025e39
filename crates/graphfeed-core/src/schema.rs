//! Schema contract and a serde-loadable schema definition.
//!
//! The sync engine only reads schema metadata: attribute types, relationship
//! cardinality, related model and inverse. [`SchemaDefinition`] is the
//! concrete implementation, loaded from JSON of the form:
//!
//! ```json
//! {
//!   "models": {
//!     "message": {
//!       "attributes": { "body": { "type": "string" } },
//!       "relationships": {
//!         "chatRoom": { "type": "hasOne", "model": "chatRoom", "inverse": "messages" }
//!       }
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::record::{Record, RelationshipRef};

/// Relationship cardinality.
///
/// Unrecognised kinds are kept so the serializer can warn and skip them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RelationshipKind {
    HasOne,
    HasMany,
    Other(String),
}

impl From<String> for RelationshipKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "hasOne" => RelationshipKind::HasOne,
            "hasMany" => RelationshipKind::HasMany,
            _ => RelationshipKind::Other(kind),
        }
    }
}

impl From<RelationshipKind> for String {
    fn from(kind: RelationshipKind) -> Self {
        match kind {
            RelationshipKind::HasOne => "hasOne".to_string(),
            RelationshipKind::HasMany => "hasMany".to_string(),
            RelationshipKind::Other(kind) => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDefinition {
    /// Codec name, e.g. `"date"`; empty means untyped
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Value used by `normalize` when the attribute is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDefinition {
    #[serde(rename = "type")]
    pub kind: RelationshipKind,
    /// Related model name
    pub model: String,
    /// Name of the relationship on `model` that points back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelDefinition {
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeDefinition>,
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipDefinition>,
}

/// Model metadata and record normalization.
pub trait Schema: Send + Sync {
    /// Definition of `model`, or `SyncError::UnknownModel`.
    fn model_definition(&self, model: &str) -> Result<&ModelDefinition>;

    /// Definition of one relationship of `model`.
    fn relationship_definition(
        &self,
        model: &str,
        relationship: &str,
    ) -> Result<&RelationshipDefinition> {
        self.model_definition(model)?
            .relationships
            .get(relationship)
            .ok_or_else(|| SyncError::UnknownRelationship {
                model: model.to_string(),
                relationship: relationship.to_string(),
            })
    }

    /// Fill in everything the model declares but the record lacks.
    fn normalize(&self, record: Record) -> Result<Record>;
}

/// Schema loaded from a JSON definition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub models: BTreeMap<String, ModelDefinition>,
}

impl SchemaDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, name: impl Into<String>, model: ModelDefinition) -> Self {
        self.models.insert(name.into(), model);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SyncError::InvalidSchema(e.to_string()))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| SyncError::InvalidSchema(e.to_string()))
    }

    /// Load a schema from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::InvalidSchema(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&contents)
    }
}

impl Schema for SchemaDefinition {
    fn model_definition(&self, model: &str) -> Result<&ModelDefinition> {
        self.models
            .get(model)
            .ok_or_else(|| SyncError::UnknownModel(model.to_string()))
    }

    fn normalize(&self, mut record: Record) -> Result<Record> {
        let definition = self.model_definition(&record.model)?;

        if record.id.is_empty() {
            record.id = uuid::Uuid::new_v4().to_string();
        }

        for (name, attribute) in &definition.attributes {
            record
                .attributes
                .entry(name.clone())
                .or_insert_with(|| attribute.default_value.clone().unwrap_or(Value::Null));
        }

        for (name, relationship) in &definition.relationships {
            let empty = match relationship.kind {
                RelationshipKind::HasOne => RelationshipRef::One(None),
                RelationshipKind::HasMany => RelationshipRef::empty_many(),
                RelationshipKind::Other(_) => continue,
            };
            record.relationships.entry(name.clone()).or_insert(empty);
        }

        Ok(record)
    }
}
