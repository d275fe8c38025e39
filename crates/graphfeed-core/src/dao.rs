//! Relationship field writes.
//!
//! Every method addresses the documents of `model` and the field that holds
//! `relationship` on that model. Ids passed as `related` are plain ids, not
//! `type:id` references.

use std::sync::Arc;

use graphfeed_state::{Driver, FieldUpdate, Predicate, Selector, Term, ID_FIELD};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Result;
use crate::metrics::METRICS;
use crate::record::{RecordIdentity, RelationshipRef};
use crate::schema::RelationshipKind;
use crate::serializer::Serializer;

pub struct RelationDao<D> {
    driver: Arc<D>,
    serializer: Arc<Serializer>,
}

impl<D> Clone for RelationDao<D> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            serializer: Arc::clone(&self.serializer),
        }
    }
}

impl<D: Driver> RelationDao<D> {
    pub fn new(driver: Arc<D>, serializer: Arc<Serializer>) -> Self {
        Self { driver, serializer }
    }

    fn location(&self, model: &str, relationship: &str) -> Result<(String, String)> {
        Ok((
            self.serializer.table_name(model),
            self.serializer.relationship_field(model, relationship)?,
        ))
    }

    async fn write(&self, table: &str, selector: Selector, update: FieldUpdate) -> Result<u64> {
        debug!(table = %table, ?selector, ?update, "relationship write");
        METRICS.inc_writes();
        Ok(self.driver.update(table, selector, vec![update]).await?)
    }

    /// Current value of a relationship as stored on the record's document.
    pub async fn fetch_relationship(
        &self,
        record: &RecordIdentity,
        relationship: &str,
    ) -> Result<RelationshipRef> {
        let definition = self
            .serializer
            .schema()
            .relationship_definition(&record.model, relationship)?;
        let (table, field) = self.location(&record.model, relationship)?;
        let doc = self.driver.get(&table, &record.id).await?;
        let value = doc.as_ref().and_then(|d| d.get(&field));

        Ok(match definition.kind {
            RelationshipKind::HasMany => RelationshipRef::Many(
                value
                    .and_then(Value::as_object)
                    .map(|set| {
                        set.iter()
                            .filter(|(_, flag)| graphfeed_state::is_truthy(flag))
                            .map(|(id, _)| RecordIdentity::new(definition.model.clone(), id.clone()))
                            .collect()
                    })
                    .unwrap_or_default(),
            ),
            _ => RelationshipRef::One(
                value
                    .and_then(graphfeed_state::id_to_string)
                    .map(|id| RecordIdentity::new(definition.model.clone(), id)),
            ),
        })
    }

    /// Point one record's to-one field at `related`, or null it.
    pub async fn replace_has_one(
        &self,
        model: &str,
        id: &str,
        relationship: &str,
        related: Option<&str>,
    ) -> Result<()> {
        let (table, field) = self.location(model, relationship)?;
        let value = related.map(Value::from).unwrap_or(Value::Null);
        self.write(&table, Selector::Id(id.to_string()), FieldUpdate::set(field, value))
            .await?;
        Ok(())
    }

    /// Null one record's to-one field, but only while it still points at
    /// `related`.
    pub async fn clear_has_one_if(
        &self,
        model: &str,
        id: &str,
        relationship: &str,
        related: &str,
    ) -> Result<()> {
        let (table, field) = self.location(model, relationship)?;
        let matching = Predicate::Eq(
            Term::Field(ID_FIELD.to_string()),
            Term::Literal(Value::from(id)),
        )
        .and(Predicate::Eq(
            Term::Field(field.clone()),
            Term::Literal(Value::from(related)),
        ));
        self.write(
            &table,
            Selector::Where(matching),
            FieldUpdate::set(field, Value::Null),
        )
        .await?;
        Ok(())
    }

    /// Point several records' to-one field at `related`, or null them.
    pub async fn replace_has_ones(
        &self,
        model: &str,
        ids: &[String],
        relationship: &str,
        related: Option<&str>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let (table, field) = self.location(model, relationship)?;
        let value = related.map(Value::from).unwrap_or(Value::Null);
        self.write(&table, Selector::Ids(ids.to_vec()), FieldUpdate::set(field, value))
            .await?;
        Ok(())
    }

    pub async fn add_to_has_many(
        &self,
        model: &str,
        id: &str,
        relationship: &str,
        related: &str,
    ) -> Result<()> {
        let (table, field) = self.location(model, relationship)?;
        self.write(
            &table,
            Selector::Id(id.to_string()),
            FieldUpdate::insert_key(field, related),
        )
        .await?;
        Ok(())
    }

    pub async fn add_to_has_manys(
        &self,
        model: &str,
        ids: &[String],
        relationship: &str,
        related: &str,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let (table, field) = self.location(model, relationship)?;
        self.write(
            &table,
            Selector::Ids(ids.to_vec()),
            FieldUpdate::insert_key(field, related),
        )
        .await?;
        Ok(())
    }

    pub async fn remove_from_has_many(
        &self,
        model: &str,
        id: &str,
        relationship: &str,
        related: &str,
    ) -> Result<()> {
        let (table, field) = self.location(model, relationship)?;
        self.write(
            &table,
            Selector::Id(id.to_string()),
            FieldUpdate::remove_key(field, related),
        )
        .await?;
        Ok(())
    }

    /// Null the to-one field of every record of `model` that points at `related`.
    pub async fn clear_has_ones_matching(
        &self,
        model: &str,
        relationship: &str,
        related: &str,
    ) -> Result<u64> {
        let (table, field) = self.location(model, relationship)?;
        let matching = Predicate::Eq(
            Term::Field(field.clone()),
            Term::Literal(Value::from(related)),
        );
        self.write(
            &table,
            Selector::Where(matching),
            FieldUpdate::set(field, Value::Null),
        )
        .await
    }

    /// Drop `related` from the id-set of every record of `model` that holds it.
    pub async fn remove_from_has_manys_matching(
        &self,
        model: &str,
        relationship: &str,
        related: &str,
    ) -> Result<u64> {
        let (table, field) = self.location(model, relationship)?;
        let matching = Predicate::Contains {
            field: field.clone(),
            key: related.to_string(),
        };
        self.write(
            &table,
            Selector::Where(matching),
            FieldUpdate::remove_key(field, related),
        )
        .await
    }

    /// Overwrite one record's id-set with exactly `related`.
    pub async fn replace_has_many(
        &self,
        model: &str,
        id: &str,
        relationship: &str,
        related: &[String],
    ) -> Result<()> {
        let (table, field) = self.location(model, relationship)?;
        let set: Map<String, Value> = related
            .iter()
            .map(|r| (r.clone(), Value::Bool(true)))
            .collect();
        self.write(
            &table,
            Selector::Id(id.to_string()),
            FieldUpdate::set(field, Value::Object(set)),
        )
        .await?;
        Ok(())
    }
}
