//! Graph mutation operations and transforms.
//!
//! [`Operation`] is a closed set. On the wire each operation is a
//! path/value patch ([`RawOperation`]):
//!
//! | operation           | op        | path                                         | value            |
//! |---------------------|-----------|----------------------------------------------|------------------|
//! | `AddRecord`         | `add`     | `[type, id]`                                 | record           |
//! | `RemoveRecord`      | `remove`  | `[type, id]`                                 |                  |
//! | `ReplaceAttribute`  | `replace` | `[type, id, "attributes", name]`             | value            |
//! | `ReplaceHasOne`     | `replace` | `[type, id, "relationships", name, "data"]`  | `"t:id"` / null  |
//! | `ReplaceHasMany`    | `replace` | `[type, id, "relationships", name, "data"]`  | `{"t:id": true}` |
//! | `AddToHasMany`      | `add`     | `[type, id, "relationships", name, "data", "t:id"]` | `true`    |
//! | `RemoveFromHasMany` | `remove`  | `[type, id, "relationships", name, "data", "t:id"]` |           |

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::record::{Record, RecordIdentity, RelationshipRef};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RawOperation", try_from = "RawOperation")]
pub enum Operation {
    AddRecord {
        record: Record,
    },
    RemoveRecord {
        record: RecordIdentity,
    },
    ReplaceAttribute {
        record: RecordIdentity,
        attribute: String,
        value: Value,
    },
    ReplaceHasOne {
        record: RecordIdentity,
        relationship: String,
        related: Option<RecordIdentity>,
    },
    ReplaceHasMany {
        record: RecordIdentity,
        relationship: String,
        related: Vec<RecordIdentity>,
    },
    AddToHasMany {
        record: RecordIdentity,
        relationship: String,
        related: RecordIdentity,
    },
    RemoveFromHasMany {
        record: RecordIdentity,
        relationship: String,
        related: RecordIdentity,
    },
}

impl Operation {
    /// Operation kind name, e.g. `"addRecord"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::AddRecord { .. } => "addRecord",
            Operation::RemoveRecord { .. } => "removeRecord",
            Operation::ReplaceAttribute { .. } => "replaceAttribute",
            Operation::ReplaceHasOne { .. } => "replaceHasOne",
            Operation::ReplaceHasMany { .. } => "replaceHasMany",
            Operation::AddToHasMany { .. } => "addToHasMany",
            Operation::RemoveFromHasMany { .. } => "removeFromHasMany",
        }
    }

    /// The record this operation targets.
    pub fn record(&self) -> RecordIdentity {
        match self {
            Operation::AddRecord { record } => record.identity(),
            Operation::RemoveRecord { record }
            | Operation::ReplaceAttribute { record, .. }
            | Operation::ReplaceHasOne { record, .. }
            | Operation::ReplaceHasMany { record, .. }
            | Operation::AddToHasMany { record, .. }
            | Operation::RemoveFromHasMany { record, .. } => record.clone(),
        }
    }

    /// `add`, `replace` or `remove`.
    pub fn op(&self) -> &'static str {
        match self {
            Operation::AddRecord { .. } | Operation::AddToHasMany { .. } => "add",
            Operation::RemoveRecord { .. } | Operation::RemoveFromHasMany { .. } => "remove",
            Operation::ReplaceAttribute { .. }
            | Operation::ReplaceHasOne { .. }
            | Operation::ReplaceHasMany { .. } => "replace",
        }
    }

    pub fn path(&self) -> Vec<String> {
        let identity = self.record();
        let mut path = vec![identity.model, identity.id];
        match self {
            Operation::AddRecord { .. } | Operation::RemoveRecord { .. } => {}
            Operation::ReplaceAttribute { attribute, .. } => {
                path.extend(["attributes".to_string(), attribute.clone()]);
            }
            Operation::ReplaceHasOne { relationship, .. }
            | Operation::ReplaceHasMany { relationship, .. } => {
                path.extend(["relationships".to_string(), relationship.clone(), "data".to_string()]);
            }
            Operation::AddToHasMany {
                relationship,
                related,
                ..
            }
            | Operation::RemoveFromHasMany {
                relationship,
                related,
                ..
            } => {
                path.extend([
                    "relationships".to_string(),
                    relationship.clone(),
                    "data".to_string(),
                    related.to_string(),
                ]);
            }
        }
        path
    }

    pub fn value(&self) -> Value {
        match self {
            Operation::AddRecord { record } => serde_json::to_value(record).unwrap_or(Value::Null),
            Operation::RemoveRecord { .. } | Operation::RemoveFromHasMany { .. } => Value::Null,
            Operation::ReplaceAttribute { value, .. } => value.clone(),
            Operation::ReplaceHasOne { related, .. } => {
                RelationshipRef::One(related.clone()).data_value()
            }
            Operation::ReplaceHasMany { related, .. } => {
                RelationshipRef::Many(related.iter().cloned().collect()).data_value()
            }
            Operation::AddToHasMany { .. } => Value::Bool(true),
        }
    }
}

/// Path/value wire form of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOperation {
    pub op: String,
    /// Segments, or a single `/`-separated string on input
    #[serde(deserialize_with = "deserialize_path")]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

fn deserialize_path<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PathForm {
        Segments(Vec<String>),
        Joined(String),
    }

    Ok(match PathForm::deserialize(deserializer)? {
        PathForm::Segments(segments) => segments,
        PathForm::Joined(joined) => joined
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

impl From<Operation> for RawOperation {
    fn from(operation: Operation) -> Self {
        RawOperation {
            op: operation.op().to_string(),
            path: operation.path(),
            value: operation.value(),
        }
    }
}

impl TryFrom<RawOperation> for Operation {
    type Error = SyncError;

    fn try_from(raw: RawOperation) -> Result<Self> {
        let unsupported = || {
            SyncError::UnsupportedOperation(format!("{} {}", raw.op, raw.path.join("/")))
        };
        let segments: Vec<&str> = raw.path.iter().map(String::as_str).collect();

        match (raw.op.as_str(), segments.as_slice()) {
            ("add", [model, id]) => {
                let mut record: Record = serde_json::from_value(raw.value.clone())
                    .map_err(|e| SyncError::UnsupportedOperation(format!("invalid record: {e}")))?;
                if record.model != *model {
                    return Err(unsupported());
                }
                if record.id.is_empty() {
                    record.id = id.to_string();
                }
                Ok(Operation::AddRecord { record })
            }
            ("remove", [model, id]) => Ok(Operation::RemoveRecord {
                record: RecordIdentity::new(*model, *id),
            }),
            ("replace", [model, id, "attributes", attribute]) => Ok(Operation::ReplaceAttribute {
                record: RecordIdentity::new(*model, *id),
                attribute: attribute.to_string(),
                value: raw.value.clone(),
            }),
            ("replace", [model, id, "relationships", relationship, "data"]) => {
                let record = RecordIdentity::new(*model, *id);
                let relationship = relationship.to_string();
                match RelationshipRef::from_data_value(&raw.value)? {
                    RelationshipRef::One(related) => Ok(Operation::ReplaceHasOne {
                        record,
                        relationship,
                        related,
                    }),
                    RelationshipRef::Many(related) => Ok(Operation::ReplaceHasMany {
                        record,
                        relationship,
                        related: related.into_iter().collect(),
                    }),
                }
            }
            ("add", [model, id, "relationships", relationship, "data", related]) => {
                Ok(Operation::AddToHasMany {
                    record: RecordIdentity::new(*model, *id),
                    relationship: relationship.to_string(),
                    related: RecordIdentity::parse(related)?,
                })
            }
            ("remove", [model, id, "relationships", relationship, "data", related]) => {
                Ok(Operation::RemoveFromHasMany {
                    record: RecordIdentity::new(*model, *id),
                    relationship: relationship.to_string(),
                    related: RecordIdentity::parse(related)?,
                })
            }
            _ => Err(unsupported()),
        }
    }
}

/// An ordered list of operations applied left to right.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub operations: Vec<Operation>,
}

impl Transform {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operations,
        }
    }
}

impl From<Operation> for Transform {
    fn from(operation: Operation) -> Self {
        Transform::new(vec![operation])
    }
}
