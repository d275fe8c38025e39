//! Record ⇄ document conversion and naming conventions.
//!
//! Documents are flat: `id`, attributes under their own names, to-one
//! relationships as `${relationship}Id` and to-many relationships as an
//! id-set `${relationship-singular}Ids` (`{related_id: true}`).

use std::collections::BTreeMap;
use std::sync::Arc;

use graphfeed_state::{document_id, id_to_string, is_truthy, Document, ID_FIELD};
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::record::{Record, RecordIdentity, RelationshipRef};
use crate::schema::{RelationshipKind, Schema};
use crate::transformations::lookup_transformation;

/// Maps between records and documents for one schema.
#[derive(Clone)]
pub struct Serializer {
    schema: Arc<dyn Schema>,
}

impl Serializer {
    pub fn new(schema: Arc<dyn Schema>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &dyn Schema {
        self.schema.as_ref()
    }

    /// `chatRoom` → `chat_rooms`
    pub fn table_name(&self, model: &str) -> String {
        pluralize(&snake_case(model))
    }

    /// `chat_rooms` → `chatRoom`
    pub fn type_from_table_name(&self, table: &str) -> String {
        camel_case(&singularize(table))
    }

    /// Field name for an `attributes/<name>` or `relationships/<name>` path.
    ///
    /// Relationship cardinality is guessed from the name: plural names map to
    /// an id-set field. Use [`Serializer::relationship_field`] when the model
    /// is known.
    pub fn field_name(&self, path: &str) -> Result<String> {
        match path.split_once('/') {
            Some(("attributes", name)) if !name.is_empty() => Ok(name.to_string()),
            Some(("relationships", name)) if !name.is_empty() => {
                Ok(match name.strip_suffix('s') {
                    Some(singular) => format!("{singular}Ids"),
                    None => format!("{name}Id"),
                })
            }
            _ => Err(SyncError::UnrecognizedFieldPath(path.to_string())),
        }
    }

    /// Field name of a relationship using its declared cardinality.
    pub fn relationship_field(&self, model: &str, relationship: &str) -> Result<String> {
        let definition = self.schema.relationship_definition(model, relationship)?;
        Ok(match definition.kind {
            RelationshipKind::HasOne => format!("{relationship}Id"),
            RelationshipKind::HasMany => {
                let singular = relationship.strip_suffix('s').unwrap_or(relationship);
                format!("{singular}Ids")
            }
            RelationshipKind::Other(_) => {
                self.field_name(&format!("relationships/{relationship}"))?
            }
        })
    }

    /// Id half of a `type:id` reference.
    pub fn id_from_ref(&self, reference: Option<&str>) -> Option<String> {
        reference
            .and_then(|r| RecordIdentity::parse(r).ok())
            .map(|identity| identity.id)
    }

    /// Record → document. To-many relationships are not written here; the
    /// write planner owns id-set fields.
    pub fn serialize(&self, record: &Record) -> Result<Document> {
        let model = self.schema.model_definition(&record.model)?;
        let mut doc = Document::new();

        doc.insert(ID_FIELD.to_string(), Value::String(record.id.clone()));

        for (name, value) in &record.attributes {
            let attr_type = model
                .attributes
                .get(name)
                .map(|a| a.kind.as_str())
                .unwrap_or_default();
            doc.insert(name.clone(), lookup_transformation(attr_type).serialize(value));
        }

        for (name, data) in &record.relationships {
            let Some(definition) = model.relationships.get(name) else {
                warn!(model = %record.model, relationship = %name, "relationship not in schema, skipping");
                continue;
            };
            match (&definition.kind, data) {
                (RelationshipKind::HasOne, RelationshipRef::One(related)) => {
                    let value = related
                        .as_ref()
                        .map(|r| Value::String(r.id.clone()))
                        .unwrap_or(Value::Null);
                    doc.insert(format!("{name}Id"), value);
                }
                (RelationshipKind::HasMany, _) => {}
                (RelationshipKind::Other(kind), _) => {
                    warn!(model = %record.model, relationship = %name, kind = %kind, "unknown relationship type, skipping");
                }
                (RelationshipKind::HasOne, RelationshipRef::Many(_)) => {
                    warn!(model = %record.model, relationship = %name, "to-many data for a hasOne relationship, skipping");
                }
            }
        }

        Ok(doc)
    }

    /// Document → normalized record.
    pub fn deserialize(&self, model_name: &str, doc: &Document) -> Result<Record> {
        let model = self.schema.model_definition(model_name)?;
        let id = document_id(doc).ok_or_else(|| SyncError::MalformedDocument {
            model: model_name.to_string(),
            reason: "document has no usable id".to_string(),
        })?;

        let mut record = Record::new(model_name, id);

        for (name, attribute) in &model.attributes {
            let raw = doc.get(name).unwrap_or(&Value::Null);
            record.attributes.insert(
                name.clone(),
                lookup_transformation(&attribute.kind).deserialize(raw),
            );
        }

        for (name, definition) in &model.relationships {
            let data = match &definition.kind {
                RelationshipKind::HasOne => RelationshipRef::One(
                    doc.get(&format!("{name}Id"))
                        .and_then(id_to_string)
                        .map(|id| RecordIdentity::new(definition.model.clone(), id)),
                ),
                RelationshipKind::HasMany => {
                    let field = self.relationship_field(model_name, name)?;
                    RelationshipRef::Many(
                        doc.get(&field)
                            .and_then(Value::as_object)
                            .map(|set| {
                                set.iter()
                                    .filter(|(_, flag)| is_truthy(flag))
                                    .map(|(id, _)| RecordIdentity::new(definition.model.clone(), id.clone()))
                                    .collect()
                            })
                            .unwrap_or_default(),
                    )
                }
                RelationshipKind::Other(kind) => {
                    warn!(model = %model_name, relationship = %name, kind = %kind, "unknown relationship type, skipping");
                    continue;
                }
            };
            record.relationships.insert(name.clone(), data);
        }

        self.schema.normalize(record)
    }

    /// Batch form of [`Serializer::deserialize`], keyed by id.
    pub fn deserialize_all<'a>(
        &self,
        model: &str,
        docs: impl IntoIterator<Item = &'a Document>,
    ) -> Result<BTreeMap<String, Record>> {
        docs.into_iter()
            .map(|doc| {
                let record = self.deserialize(model, doc)?;
                Ok((record.id.clone(), record))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Inflection
// ---------------------------------------------------------------------------

fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '-' {
            out.push('_');
        } else {
            out.push(c);
        }
    }
    out
}

fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' || c == '-' {
            upper = true;
        } else if upper {
            out.push(c.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn is_vowel(c: char) -> bool {
    matches!(c, 'a' | 'e' | 'i' | 'o' | 'u')
}

fn pluralize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix('y') {
        if !stem.ends_with(is_vowel) && !stem.is_empty() {
            return format!("{stem}ies");
        }
    }
    if ["s", "x", "z", "ch", "sh"].iter().any(|s| word.ends_with(s)) {
        return format!("{word}es");
    }
    format!("{word}s")
}

fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        return format!("{stem}y");
    }
    for suffix in ["sses", "xes", "zes", "ches", "shes"] {
        if word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    match word.strip_suffix('s') {
        Some(stem) if !stem.ends_with('s') => stem.to_string(),
        _ => word.to_string(),
    }
}
