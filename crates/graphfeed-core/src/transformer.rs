//! Relational write planner.
//!
//! Turns each [`Operation`] into the document writes that apply it and keep
//! the inverse relationship fields on the other side consistent.
//!
//! Writes that clear stale pointers always complete before the writes that
//! set new ones. Independent writes within one operation run concurrently.
//! The first failed write aborts the transform; nothing is rolled back.

use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use graphfeed_state::{Driver, FieldUpdate, Selector};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::dao::RelationDao;
use crate::error::Result;
use crate::metrics::METRICS;
use crate::obs::emit_transform_applied;
use crate::operation::{Operation, Transform};
use crate::record::{Record, RecordIdentity, RelationshipRef};
use crate::schema::RelationshipKind;
use crate::serializer::Serializer;
use crate::transformations::lookup_transformation;

/// The relationship on the related model that points back.
struct Inverse {
    model: String,
    relationship: String,
    kind: RelationshipKind,
}

pub struct Transformer<D> {
    driver: Arc<D>,
    serializer: Arc<Serializer>,
    dao: RelationDao<D>,
}

impl<D: Driver> Transformer<D> {
    pub fn new(driver: Arc<D>, serializer: Arc<Serializer>) -> Self {
        let dao = RelationDao::new(Arc::clone(&driver), Arc::clone(&serializer));
        Self {
            driver,
            serializer,
            dao,
        }
    }

    /// Apply every operation in order.
    #[instrument(skip_all, fields(transform_id = %transform.id, operations = transform.operations.len()))]
    pub async fn transform(&self, transform: &Transform) -> Result<()> {
        let started = Instant::now();
        for operation in &transform.operations {
            self.apply(operation).await?;
            METRICS.record_applied(operation);
        }
        METRICS.inc_transforms();
        emit_transform_applied(
            &transform.id.to_string(),
            transform.operations.len(),
            started.elapsed().as_millis() as u64,
        );
        Ok(())
    }

    /// Apply one operation.
    pub async fn apply(&self, operation: &Operation) -> Result<()> {
        debug!(kind = operation.kind(), record = %operation.record(), "applying operation");
        match operation {
            Operation::AddRecord { record } => self.add_record(record).await,
            Operation::RemoveRecord { record } => self.remove_record(record).await,
            Operation::ReplaceAttribute {
                record,
                attribute,
                value,
            } => self.replace_attribute(record, attribute, value).await,
            Operation::ReplaceHasOne {
                record,
                relationship,
                related,
            } => {
                self.replace_has_one(record, relationship, related.as_ref())
                    .await
            }
            Operation::ReplaceHasMany {
                record,
                relationship,
                related,
            } => self.replace_has_many(record, relationship, related).await,
            Operation::AddToHasMany {
                record,
                relationship,
                related,
            } => self.add_to_has_many(record, relationship, related).await,
            Operation::RemoveFromHasMany {
                record,
                relationship,
                related,
            } => {
                self.remove_from_has_many(record, relationship, related)
                    .await
            }
        }
    }

    fn inverse(&self, model: &str, relationship: &str) -> Result<Option<Inverse>> {
        let schema = self.serializer.schema();
        let definition = schema.relationship_definition(model, relationship)?;
        let Some(inverse) = &definition.inverse else {
            return Ok(None);
        };
        let inverse_definition = schema.relationship_definition(&definition.model, inverse)?;
        Ok(Some(Inverse {
            model: definition.model.clone(),
            relationship: inverse.clone(),
            kind: inverse_definition.kind.clone(),
        }))
    }

    /// Point `target`'s inverse field at `id`.
    async fn link(&self, inverse: &Inverse, target: &str, id: &str) -> Result<()> {
        match inverse.kind {
            RelationshipKind::HasOne => {
                self.dao
                    .replace_has_one(&inverse.model, target, &inverse.relationship, Some(id))
                    .await
            }
            RelationshipKind::HasMany => {
                self.dao
                    .add_to_has_many(&inverse.model, target, &inverse.relationship, id)
                    .await
            }
            RelationshipKind::Other(_) => Ok(()),
        }
    }

    /// Point every record in `targets`' inverse field at `id`.
    async fn link_all(&self, inverse: &Inverse, targets: &[String], id: &str) -> Result<()> {
        match inverse.kind {
            RelationshipKind::HasOne => {
                self.dao
                    .replace_has_ones(&inverse.model, targets, &inverse.relationship, Some(id))
                    .await
            }
            RelationshipKind::HasMany => {
                self.dao
                    .add_to_has_manys(&inverse.model, targets, &inverse.relationship, id)
                    .await
            }
            RelationshipKind::Other(_) => Ok(()),
        }
    }

    /// Remove `id` from `target`'s inverse field. A to-one inverse that has
    /// since moved to another record is left alone.
    async fn unlink(&self, inverse: &Inverse, target: &str, id: &str) -> Result<()> {
        match inverse.kind {
            RelationshipKind::HasOne => {
                self.dao
                    .clear_has_one_if(&inverse.model, target, &inverse.relationship, id)
                    .await
            }
            RelationshipKind::HasMany => {
                self.dao
                    .remove_from_has_many(&inverse.model, target, &inverse.relationship, id)
                    .await
            }
            RelationshipKind::Other(_) => Ok(()),
        }
    }

    /// Remove `id` from the inverse field of every related record holding it.
    async fn unlink_everywhere(&self, inverse: &Inverse, id: &str) -> Result<()> {
        match inverse.kind {
            RelationshipKind::HasOne => {
                self.dao
                    .clear_has_ones_matching(&inverse.model, &inverse.relationship, id)
                    .await?;
            }
            RelationshipKind::HasMany => {
                self.dao
                    .remove_from_has_manys_matching(&inverse.model, &inverse.relationship, id)
                    .await?;
            }
            RelationshipKind::Other(_) => {}
        }
        Ok(())
    }

    /// Take `members` away from whichever record of `model` currently owns
    /// them through `relationship`.
    async fn detach_members(&self, model: &str, relationship: &str, members: &[String]) -> Result<()> {
        try_join_all(members.iter().map(|member| {
            self.dao
                .remove_from_has_manys_matching(model, relationship, member)
        }))
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(model = %record.model, id = %record.id))]
    async fn add_record(&self, record: &Record) -> Result<()> {
        let table = self.serializer.table_name(&record.model);
        let doc = self.serializer.serialize(record)?;
        METRICS.inc_writes();
        self.driver.insert(&table, doc).await?;

        for (name, data) in &record.relationships {
            let definition = self
                .serializer
                .schema()
                .relationship_definition(&record.model, name)?;
            let inverse = self.inverse(&record.model, name)?;

            match (&definition.kind, data) {
                (RelationshipKind::HasOne, RelationshipRef::One(Some(related))) => {
                    let Some(inverse) = &inverse else {
                        continue;
                    };
                    if inverse.kind == RelationshipKind::HasOne {
                        // Also nulls the new record's own pointer; restored below.
                        self.dao
                            .clear_has_ones_matching(&record.model, name, &related.id)
                            .await?;
                        let own = self.dao.replace_has_one(
                            &record.model,
                            &record.id,
                            name,
                            Some(&related.id),
                        );
                        futures::try_join!(own, self.link(inverse, &related.id, &record.id))?;
                    } else {
                        self.link(inverse, &related.id, &record.id).await?;
                    }
                }
                (RelationshipKind::HasMany, RelationshipRef::Many(members)) if !members.is_empty() => {
                    let ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
                    if matches!(&inverse, Some(i) if i.kind == RelationshipKind::HasOne) {
                        self.detach_members(&record.model, name, &ids).await?;
                    }
                    let own = self.dao.replace_has_many(&record.model, &record.id, name, &ids);
                    match &inverse {
                        Some(inverse) => {
                            futures::try_join!(own, self.link_all(inverse, &ids, &record.id))?;
                        }
                        None => own.await?,
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(model = %record.model, id = %record.id))]
    async fn remove_record(&self, record: &RecordIdentity) -> Result<()> {
        let model = self.serializer.schema().model_definition(&record.model)?;
        let mut inverses = Vec::new();
        for name in model.relationships.keys() {
            if let Some(inverse) = self.inverse(&record.model, name)? {
                inverses.push(inverse);
            }
        }

        try_join_all(
            inverses
                .iter()
                .map(|inverse| self.unlink_everywhere(inverse, &record.id)),
        )
        .await?;

        let table = self.serializer.table_name(&record.model);
        METRICS.inc_writes();
        self.driver.delete(&table, &record.id).await?;
        Ok(())
    }

    async fn replace_attribute(
        &self,
        record: &RecordIdentity,
        attribute: &str,
        value: &Value,
    ) -> Result<()> {
        let model = self.serializer.schema().model_definition(&record.model)?;
        let attr_type = model
            .attributes
            .get(attribute)
            .map(|a| a.kind.as_str())
            .unwrap_or_default();
        let field = self
            .serializer
            .field_name(&format!("attributes/{attribute}"))?;
        let table = self.serializer.table_name(&record.model);

        METRICS.inc_writes();
        self.driver
            .update(
                &table,
                Selector::Id(record.id.clone()),
                vec![FieldUpdate::set(
                    field,
                    lookup_transformation(attr_type).serialize(value),
                )],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(model = %record.model, id = %record.id, relationship = %relationship))]
    async fn replace_has_one(
        &self,
        record: &RecordIdentity,
        relationship: &str,
        related: Option<&RecordIdentity>,
    ) -> Result<()> {
        let inverse = self.inverse(&record.model, relationship)?;
        let new_id = related.map(|r| r.id.as_str());

        if let Some(inverse) = &inverse {
            let previous = match self.dao.fetch_relationship(record, relationship).await? {
                RelationshipRef::One(previous) => previous.map(|p| p.id),
                RelationshipRef::Many(_) => None,
            };
            if let Some(previous) = previous.filter(|p| Some(p.as_str()) != new_id) {
                self.unlink(inverse, &previous, &record.id).await?;
            }
            if let (Some(new_id), RelationshipKind::HasOne) = (new_id, &inverse.kind) {
                self.dao
                    .clear_has_ones_matching(&record.model, relationship, new_id)
                    .await?;
            }
        }

        let forward = self
            .dao
            .replace_has_one(&record.model, &record.id, relationship, new_id);
        match (&inverse, new_id) {
            (Some(inverse), Some(new_id)) => {
                futures::try_join!(forward, self.link(inverse, new_id, &record.id))?;
            }
            _ => forward.await?,
        }
        Ok(())
    }

    #[instrument(skip_all, fields(model = %record.model, id = %record.id, relationship = %relationship))]
    async fn replace_has_many(
        &self,
        record: &RecordIdentity,
        relationship: &str,
        related: &[RecordIdentity],
    ) -> Result<()> {
        let ids: Vec<String> = related.iter().map(|r| r.id.clone()).collect();
        let inverse = self.inverse(&record.model, relationship)?;

        let Some(inverse) = inverse else {
            return self
                .dao
                .replace_has_many(&record.model, &record.id, relationship, &ids)
                .await;
        };

        if inverse.kind == RelationshipKind::HasOne {
            self.detach_members(&record.model, relationship, &ids).await?;
        }

        let own = self
            .dao
            .replace_has_many(&record.model, &record.id, relationship, &ids);
        let inverses = async {
            self.unlink_everywhere(&inverse, &record.id).await?;
            self.link_all(&inverse, &ids, &record.id).await
        };
        futures::try_join!(own, inverses)?;
        Ok(())
    }

    #[instrument(skip_all, fields(model = %record.model, id = %record.id, relationship = %relationship))]
    async fn add_to_has_many(
        &self,
        record: &RecordIdentity,
        relationship: &str,
        related: &RecordIdentity,
    ) -> Result<()> {
        let inverse = self.inverse(&record.model, relationship)?;

        if matches!(&inverse, Some(i) if i.kind == RelationshipKind::HasOne) {
            self.dao
                .remove_from_has_manys_matching(&record.model, relationship, &related.id)
                .await?;
        }

        let own = self
            .dao
            .add_to_has_many(&record.model, &record.id, relationship, &related.id);
        match &inverse {
            Some(inverse) => {
                futures::try_join!(own, self.link(inverse, &related.id, &record.id))?;
            }
            None => own.await?,
        }
        Ok(())
    }

    #[instrument(skip_all, fields(model = %record.model, id = %record.id, relationship = %relationship))]
    async fn remove_from_has_many(
        &self,
        record: &RecordIdentity,
        relationship: &str,
        related: &RecordIdentity,
    ) -> Result<()> {
        let inverse = self.inverse(&record.model, relationship)?;

        let own = self
            .dao
            .remove_from_has_many(&record.model, &record.id, relationship, &related.id);
        match &inverse {
            Some(inverse) => {
                futures::try_join!(own, self.unlink(inverse, &related.id, &record.id))?;
            }
            None => own.await?,
        }
        Ok(())
    }
}
