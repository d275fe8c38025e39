//! Live-query engine: changefeed events in, graph operations out.
//!
//! A query is either an oql [`Expression`] or a native [`Query`]. Its
//! changefeed is requested with the initial snapshot and state markers; the
//! snapshot is replayed as `addRecord` operations and the live query becomes
//! ready on the `ready` marker. Each later change is classified by which of
//! `old_val` / `new_val` are present:
//!
//! - new only: `addRecord`
//! - both: one operation per changed attribute or relationship
//! - old only: `removeRecord`

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::StreamExt;
use graphfeed_state::{
    Change, ChangeCursor, ChangeOptions, Document, Driver, FeedState, Query, QueryOutput,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, Instrument};

use crate::error::{Result, SyncError};
use crate::live::{LiveQueryState, LiveShared, PendingLiveQuery, ReplayPolicy};
use crate::metrics::METRICS;
use crate::obs::{
    emit_live_query_error, emit_live_query_ready, emit_operation_emitted, live_query_span,
};
use crate::oql::{CompiledQuery, Expression, QueryEvaluator};
use crate::operation::{Operation, Transform};
use crate::record::{Record, RelationshipRef};
use crate::serializer::Serializer;

/// A query as accepted by `query` and `live_query`: exactly one of `oql` or
/// `native` must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oql: Option<Expression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<Query>,
}

impl SourceQuery {
    pub fn oql(expression: Expression) -> Self {
        Self {
            oql: Some(expression),
            native: None,
        }
    }

    pub fn native(query: Query) -> Self {
        Self {
            oql: None,
            native: Some(query),
        }
    }
}

/// Result of a one-shot query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Point lookup
    Record(Option<Record>),
    /// Collection, keyed by id
    Records(BTreeMap<String, Record>),
}

impl QueryResult {
    pub fn into_records(self) -> Vec<Record> {
        match self {
            QueryResult::Record(record) => record.into_iter().collect(),
            QueryResult::Records(records) => records.into_values().collect(),
        }
    }
}

pub struct Subscriber<D> {
    driver: Arc<D>,
    serializer: Arc<Serializer>,
    evaluator: Arc<QueryEvaluator>,
    replay: ReplayPolicy,
}

impl<D: Driver> Subscriber<D> {
    pub fn new(
        driver: Arc<D>,
        serializer: Arc<Serializer>,
        evaluator: Arc<QueryEvaluator>,
        replay: ReplayPolicy,
    ) -> Self {
        Self {
            driver,
            serializer,
            evaluator,
            replay,
        }
    }

    fn compile(&self, query: &SourceQuery) -> Result<CompiledQuery> {
        match (&query.oql, &query.native) {
            (Some(expression), None) => self.evaluator.compile(expression),
            (None, Some(native)) => Ok(CompiledQuery::native(native.clone())),
            _ => Err(SyncError::UnsupportedQuery(
                "only oql and reql queries are supported".to_string(),
            )),
        }
    }

    /// Model of a compiled query's results, probing the driver if the query
    /// does not say.
    async fn resolve_model(&self, compiled: &CompiledQuery) -> Result<String> {
        if let Some(model) = &compiled.model {
            return Ok(model.clone());
        }
        let table = self.driver.table_of(&compiled.query).await?;
        let model = self.serializer.type_from_table_name(&table);
        debug!(table = %table, model = %model, "resolved model from table");
        Ok(model)
    }

    /// Run a query once.
    #[instrument(skip_all)]
    pub async fn query(&self, query: &SourceQuery) -> Result<QueryResult> {
        let compiled = self.compile(query)?;
        let model = self.resolve_model(&compiled).await?;

        match self.driver.run(&compiled.query).await? {
            QueryOutput::Single(doc) => Ok(QueryResult::Record(
                doc.map(|d| self.serializer.deserialize(&model, &d))
                    .transpose()?,
            )),
            QueryOutput::Many(docs) if compiled.singular => Ok(QueryResult::Record(
                docs.first()
                    .map(|d| self.serializer.deserialize(&model, d))
                    .transpose()?,
            )),
            QueryOutput::Many(docs) => Ok(QueryResult::Records(
                self.serializer.deserialize_all(&model, &docs)?,
            )),
        }
    }

    /// Start a live query. The returned handle resolves once the feed is
    /// ready.
    #[instrument(skip_all)]
    pub async fn live_query(&self, query: &SourceQuery) -> Result<PendingLiveQuery> {
        let compiled = self.compile(query)?;
        let model = self.resolve_model(&compiled).await?;
        let cursor = self.driver.changes(&compiled.query, feed_options()).await?;

        let shared = LiveShared::new(model.clone(), self.replay);
        let task = tokio::spawn(
            run_feed(cursor, Arc::clone(&shared), Arc::clone(&self.serializer), model.clone())
                .instrument(live_query_span(&model)),
        );
        shared.attach(task);
        METRICS.inc_live_queries();

        Ok(PendingLiveQuery::new(shared))
    }

    /// Push each change's operations as one [`Transform`] on `sink`.
    ///
    /// Resolves once the feed is ready; the returned task keeps forwarding
    /// until the feed ends. A failure after that point is pushed as the
    /// last item on `sink`.
    #[instrument(skip(self, query, sink))]
    pub async fn subscribe(
        &self,
        model: &str,
        query: &Query,
        sink: broadcast::Sender<Result<Transform>>,
    ) -> Result<JoinHandle<()>> {
        let cursor = self.driver.changes(query, feed_options()).await?;
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(
            forward_transforms(
                cursor,
                Arc::clone(&self.serializer),
                model.to_string(),
                sink,
                ready_tx,
            )
            .instrument(live_query_span(model)),
        );

        match ready_rx.await {
            Ok(Ok(())) => Ok(task),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SyncError::Closed),
        }
    }
}

fn feed_options() -> ChangeOptions {
    ChangeOptions {
        squash: false,
        include_states: true,
        include_initial: true,
    }
}

/// Operations for one document change.
pub fn process_change(
    serializer: &Serializer,
    model: &str,
    old_val: Option<&Document>,
    new_val: Option<&Document>,
) -> Result<Vec<Operation>> {
    match (old_val, new_val) {
        (None, Some(new)) => Ok(vec![Operation::AddRecord {
            record: serializer.deserialize(model, new)?,
        }]),
        (Some(old), Some(new)) => {
            let old = serializer.deserialize(model, old)?;
            let new = serializer.deserialize(model, new)?;
            Ok(diff_records(&old, &new))
        }
        (Some(old), None) => Ok(vec![Operation::RemoveRecord {
            record: serializer.deserialize(model, old)?.identity(),
        }]),
        (None, None) => Err(SyncError::UnhandledChange(format!(
            "change for `{model}` has neither old_val nor new_val"
        ))),
    }
}

/// Field-level diff of two versions of one record: attributes first, then
/// relationships, each in name order.
pub fn diff_records(old: &Record, new: &Record) -> Vec<Operation> {
    let identity = new.identity();
    let mut operations = Vec::new();

    let mut names: Vec<&String> = old.attributes.keys().chain(new.attributes.keys()).collect();
    names.sort();
    names.dedup();

    for name in names {
        let before = old.attributes.get(name);
        let after = new.attributes.get(name);
        if before != after {
            operations.push(Operation::ReplaceAttribute {
                record: identity.clone(),
                attribute: name.clone(),
                value: after.cloned().unwrap_or(serde_json::Value::Null),
            });
        }
    }

    let mut names: Vec<&String> = old
        .relationships
        .keys()
        .chain(new.relationships.keys())
        .collect();
    names.sort();
    names.dedup();

    for name in names {
        match (old.relationships.get(name), new.relationships.get(name)) {
            (before, Some(RelationshipRef::Many(after))) => {
                let empty = BTreeSet::new();
                let before = match before {
                    Some(RelationshipRef::Many(before)) => before,
                    _ => &empty,
                };
                for added in after.difference(before) {
                    operations.push(Operation::AddToHasMany {
                        record: identity.clone(),
                        relationship: name.clone(),
                        related: added.clone(),
                    });
                }
                for removed in before.difference(after) {
                    operations.push(Operation::RemoveFromHasMany {
                        record: identity.clone(),
                        relationship: name.clone(),
                        related: removed.clone(),
                    });
                }
            }
            (before, after) => {
                let before = match before {
                    Some(RelationshipRef::One(r)) => r.clone(),
                    _ => None,
                };
                let after = match after {
                    Some(RelationshipRef::One(r)) => r.clone(),
                    _ => None,
                };
                if before != after {
                    operations.push(Operation::ReplaceHasOne {
                        record: identity.clone(),
                        relationship: name.clone(),
                        related: after,
                    });
                }
            }
        }
    }

    operations
}

async fn run_feed(
    mut cursor: ChangeCursor,
    shared: Arc<LiveShared>,
    serializer: Arc<Serializer>,
    model: String,
) {
    let mut emitted: u64 = 0;
    while let Some(event) = cursor.next().await {
        let change = match event {
            Ok(change) => change,
            Err(e) => {
                let error = SyncError::from(e);
                emit_live_query_error(&model, &error);
                METRICS.inc_live_query_failures();
                shared.fail(error);
                return;
            }
        };

        match change {
            Change::State(FeedState::Ready) => {
                shared.mark_streaming();
                emit_live_query_ready(&model, emitted);
            }
            Change::State(FeedState::Initializing) => {}
            Change::Document { old_val, new_val } => {
                match process_change(&serializer, &model, old_val.as_ref(), new_val.as_ref()) {
                    Ok(operations) => {
                        for operation in operations {
                            METRICS.record_emitted(&operation);
                            emit_operation_emitted(&model, operation.kind(), &operation.record().id);
                            shared.broadcast.publish(Ok(operation));
                            emitted += 1;
                        }
                    }
                    Err(error) => {
                        emit_live_query_error(&model, &error);
                        METRICS.inc_live_query_failures();
                        shared.fail(error);
                        return;
                    }
                }
            }
        }
    }
    shared.settle(LiveQueryState::Closed, "feed ended");
}

async fn forward_transforms(
    mut cursor: ChangeCursor,
    serializer: Arc<Serializer>,
    model: String,
    sink: broadcast::Sender<Result<Transform>>,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut ready = Some(ready);
    while let Some(event) = cursor.next().await {
        let outcome = match event {
            Ok(Change::State(FeedState::Ready)) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
                emit_live_query_ready(&model, 0);
                continue;
            }
            Ok(Change::State(FeedState::Initializing)) => continue,
            Ok(Change::Document { old_val, new_val }) => {
                process_change(&serializer, &model, old_val.as_ref(), new_val.as_ref())
            }
            Err(e) => Err(SyncError::from(e)),
        };

        match outcome {
            Ok(operations) if operations.is_empty() => {}
            Ok(operations) => {
                for operation in &operations {
                    METRICS.record_emitted(operation);
                    emit_operation_emitted(&model, operation.kind(), &operation.record().id);
                }
                // No receivers is fine; late `on_transform` callers miss it.
                let _ = sink.send(Ok(Transform::new(operations)));
            }
            Err(error) => {
                emit_live_query_error(&model, &error);
                METRICS.inc_live_query_failures();
                match ready.take() {
                    Some(ready) => {
                        let _ = ready.send(Err(error));
                    }
                    None => {
                        let _ = sink.send(Err(error));
                    }
                }
                return;
            }
        }
    }
}
