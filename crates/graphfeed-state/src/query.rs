//! Native query AST shared by every driver
//!
//! A [`Query`] is what the oql bindings compile to and what drivers execute:
//! - `Table`: every document of a table
//! - `Get`: point lookup by id
//! - `Filter`: a query narrowed by a row [`Predicate`]
//!
//! Writes address documents through a [`Selector`] and describe their
//! effect as a list of [`FieldUpdate`]s. [`apply_updates`] and
//! [`Predicate::matches`] give the reference semantics that drivers
//! without native support evaluate client-side.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A flat database document.
pub type Document = Map<String, Value>;

/// Primary key field of every document.
pub const ID_FIELD: &str = "id";

/// Render a document id as a string key.
///
/// Documents inserted outside the adapter may carry numeric ids.
pub fn id_to_string(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Id of a document, if it has a usable one.
pub fn document_id(doc: &Document) -> Option<String> {
    doc.get(ID_FIELD).and_then(id_to_string)
}

/// Row-level value expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    /// Field of the current row (`r.row(field)`)
    Field(String),
    /// Constant value
    Literal(Value),
}

impl Term {
    fn resolve<'a>(&'a self, doc: &'a Document) -> &'a Value {
        match self {
            Term::Field(name) => doc.get(name).unwrap_or(&Value::Null),
            Term::Literal(value) => value,
        }
    }
}

/// Boolean row predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Const(bool),
    Eq(Term, Term),
    /// The id-set in `field` has `key` as a truthy member
    Contains { field: String, key: String },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    pub fn and(self, other: Predicate) -> Predicate {
        Predicate::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Predicate) -> Predicate {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    /// Evaluate against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Predicate::Const(value) => *value,
            Predicate::Eq(a, b) => values_equal(a.resolve(doc), b.resolve(doc)),
            Predicate::Contains { field, key } => doc
                .get(field)
                .and_then(Value::as_object)
                .and_then(|set| set.get(key))
                .map(is_truthy)
                .unwrap_or(false),
            Predicate::And(a, b) => a.matches(doc) && b.matches(doc),
            Predicate::Or(a, b) => a.matches(doc) || b.matches(doc),
        }
    }
}

/// Numbers compare by value so `1` and `1.0` are equal.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// JavaScript-style truthiness of an id-set member flag.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// A native, driver-executable query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    Table {
        table: String,
    },
    Get {
        table: String,
        id: String,
    },
    Filter {
        source: Box<Query>,
        predicate: Predicate,
    },
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Query::Table {
            table: table.into(),
        }
    }

    pub fn get(table: impl Into<String>, id: impl Into<String>) -> Self {
        Query::Get {
            table: table.into(),
            id: id.into(),
        }
    }

    pub fn filter(self, predicate: Predicate) -> Self {
        Query::Filter {
            source: Box::new(self),
            predicate,
        }
    }

    /// Table the query reads from.
    pub fn table_name(&self) -> &str {
        match self {
            Query::Table { table } | Query::Get { table, .. } => table,
            Query::Filter { source, .. } => source.table_name(),
        }
    }

    /// Whether the query selects at most one document by id.
    pub fn is_point_lookup(&self) -> bool {
        matches!(self, Query::Get { .. })
    }

    /// Whether a document of this query's table belongs to the result set.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Query::Table { .. } => true,
            Query::Get { id, .. } => document_id(doc).as_deref() == Some(id.as_str()),
            Query::Filter { source, predicate } => source.matches(doc) && predicate.matches(doc),
        }
    }
}

/// Result of running a query once.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Single(Option<Document>),
    Many(Vec<Document>),
}

/// Which documents of a table a write addresses.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// `get(id)`
    Id(String),
    /// `getAll(ids)`
    Ids(Vec<String>),
    /// `filter(predicate)`
    Where(Predicate),
}

impl Selector {
    pub fn selects(&self, doc: &Document) -> bool {
        match self {
            Selector::Id(id) => document_id(doc).as_deref() == Some(id.as_str()),
            Selector::Ids(ids) => document_id(doc)
                .map(|id| ids.iter().any(|candidate| *candidate == id))
                .unwrap_or(false),
            Selector::Where(predicate) => predicate.matches(doc),
        }
    }
}

/// One field-level write.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    /// Overwrite the field with a literal value
    Set { field: String, value: Value },
    /// Add `key: true` to the id-set in `field`, creating it if needed
    InsertKey { field: String, key: String },
    /// Drop `key` from the id-set in `field`
    RemoveKey { field: String, key: String },
}

impl FieldUpdate {
    pub fn set(field: impl Into<String>, value: Value) -> Self {
        FieldUpdate::Set {
            field: field.into(),
            value,
        }
    }

    pub fn insert_key(field: impl Into<String>, key: impl Into<String>) -> Self {
        FieldUpdate::InsertKey {
            field: field.into(),
            key: key.into(),
        }
    }

    pub fn remove_key(field: impl Into<String>, key: impl Into<String>) -> Self {
        FieldUpdate::RemoveKey {
            field: field.into(),
            key: key.into(),
        }
    }
}

/// Apply updates to a document in place; returns whether anything changed.
pub fn apply_updates(doc: &mut Document, updates: &[FieldUpdate]) -> bool {
    let before = doc.clone();
    for update in updates {
        match update {
            FieldUpdate::Set { field, value } => {
                doc.insert(field.clone(), value.clone());
            }
            FieldUpdate::InsertKey { field, key } => {
                let slot = doc
                    .entry(field.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(set) = slot {
                    set.insert(key.clone(), Value::Bool(true));
                }
            }
            FieldUpdate::RemoveKey { field, key } => {
                if let Some(Value::Object(set)) = doc.get_mut(field) {
                    set.remove(key);
                }
            }
        }
    }
    *doc != before
}
