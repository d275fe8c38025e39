//! Normalized records and the references between them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Result, SyncError};

/// A `type:id` pointer to a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordIdentity {
    #[serde(rename = "type")]
    pub model: String,
    pub id: String,
}

impl RecordIdentity {
    pub fn new(model: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
        }
    }

    /// Parse a `type:id` reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        match reference.split_once(':') {
            Some((model, id)) if !model.is_empty() && !id.is_empty() => Ok(Self::new(model, id)),
            _ => Err(SyncError::InvalidReference(reference.to_string())),
        }
    }
}

impl fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model, self.id)
    }
}

impl FromStr for RecordIdentity {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Relationship data of a record.
///
/// JSON form is `{"data": ...}` where `data` is `null` or a `type:id` string
/// for a to-one relationship, and a map of `type:id` to `true` for a to-many
/// relationship. Map members count only if their value is truthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipRef {
    One(Option<RecordIdentity>),
    Many(BTreeSet<RecordIdentity>),
}

impl RelationshipRef {
    pub fn empty_many() -> Self {
        RelationshipRef::Many(BTreeSet::new())
    }

    pub fn data_value(&self) -> Value {
        match self {
            RelationshipRef::One(None) => Value::Null,
            RelationshipRef::One(Some(identity)) => Value::String(identity.to_string()),
            RelationshipRef::Many(members) => Value::Object(
                members
                    .iter()
                    .map(|m| (m.to_string(), Value::Bool(true)))
                    .collect(),
            ),
        }
    }

    pub fn from_data_value(data: &Value) -> Result<Self> {
        match data {
            Value::Null => Ok(RelationshipRef::One(None)),
            Value::String(reference) => {
                Ok(RelationshipRef::One(Some(RecordIdentity::parse(reference)?)))
            }
            Value::Object(members) => members
                .iter()
                .filter(|(_, flag)| graphfeed_state::is_truthy(flag))
                .map(|(reference, _)| RecordIdentity::parse(reference))
                .collect::<Result<BTreeSet<_>>>()
                .map(RelationshipRef::Many),
            other => Err(SyncError::InvalidReference(other.to_string())),
        }
    }
}

impl Serialize for RelationshipRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut wrapper = Map::new();
        wrapper.insert("data".to_string(), self.data_value());
        wrapper.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RelationshipRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wrapper = Map::<String, Value>::deserialize(deserializer)?;
        let data = wrapper.get("data").unwrap_or(&Value::Null);
        RelationshipRef::from_data_value(data).map_err(D::Error::custom)
    }
}

/// A normalized record: `{type, id, attributes, relationships}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "type")]
    pub model: String,
    /// Empty until assigned by the caller or by `Schema::normalize`
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipRef>,
}

impl Record {
    pub fn new(model: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
        }
    }

    pub fn identity(&self) -> RecordIdentity {
        RecordIdentity::new(self.model.clone(), self.id.clone())
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_has_one(mut self, name: impl Into<String>, related: Option<RecordIdentity>) -> Self {
        self.relationships
            .insert(name.into(), RelationshipRef::One(related));
        self
    }

    pub fn with_has_many(
        mut self,
        name: impl Into<String>,
        related: impl IntoIterator<Item = RecordIdentity>,
    ) -> Self {
        self.relationships
            .insert(name.into(), RelationshipRef::Many(related.into_iter().collect()));
        self
    }
}
