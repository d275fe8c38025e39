//! The source facade.
//!
//! `Source` owns a serializer, write planner and live-query engine over one
//! driver and one schema, and is the single entry point for applications.

use std::sync::{Arc, Mutex};

use graphfeed_state::{Driver, Query, QueryOutput};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::live::{LiveQuery, PendingLiveQuery, ReplayPolicy};
use crate::oql::QueryEvaluator;
use crate::operation::Transform;
use crate::record::Record;
use crate::schema::Schema;
use crate::serializer::Serializer;
use crate::subscriber::{QueryResult, SourceQuery, Subscriber};
use crate::transformer::Transformer;

const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

/// Source configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// History retained for late subscribers of each live query
    pub replay: ReplayPolicy,
    /// Buffer of the `did_transform` channel used by `subscribe`
    pub notification_capacity: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            replay: ReplayPolicy::All,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

pub struct Source<D: Driver> {
    driver: Arc<D>,
    serializer: Arc<Serializer>,
    transformer: Transformer<D>,
    subscriber: Subscriber<D>,
    did_transform: broadcast::Sender<Result<Transform>>,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: Driver> Source<D> {
    pub fn new(driver: Arc<D>, schema: Arc<dyn Schema>) -> Self {
        Self::with_config(driver, schema, SourceConfig::default())
    }

    pub fn with_config(driver: Arc<D>, schema: Arc<dyn Schema>, config: SourceConfig) -> Self {
        let serializer = Arc::new(Serializer::new(schema));
        let evaluator = Arc::new(QueryEvaluator::new(Arc::clone(&serializer)));
        let transformer = Transformer::new(Arc::clone(&driver), Arc::clone(&serializer));
        let subscriber = Subscriber::new(
            Arc::clone(&driver),
            Arc::clone(&serializer),
            evaluator,
            config.replay,
        );
        let (did_transform, _) = broadcast::channel(config.notification_capacity.max(1));

        Self {
            driver,
            serializer,
            transformer,
            subscriber,
            did_transform,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    /// Apply a transform's operations to the database, in order.
    pub async fn transform(&self, transform: &Transform) -> Result<()> {
        self.transformer.transform(transform).await
    }

    /// Run a query once.
    pub async fn query(&self, query: &SourceQuery) -> Result<QueryResult> {
        self.subscriber.query(query).await
    }

    /// Start a live query and wait for it to become ready.
    pub async fn live_query(&self, query: &SourceQuery) -> Result<LiveQuery> {
        self.subscriber.live_query(query).await?.ready().await
    }

    /// Start a live query without waiting; the handle can be cancelled
    /// before it becomes ready.
    pub async fn live_query_pending(&self, query: &SourceQuery) -> Result<PendingLiveQuery> {
        self.subscriber.live_query(query).await
    }

    /// Publish changes to `query` as transforms on [`Source::on_transform`].
    ///
    /// Resolves once the initial contents have been published.
    pub async fn subscribe(&self, model: &str, query: &Query) -> Result<()> {
        let task = self
            .subscriber
            .subscribe(model, query, self.did_transform.clone())
            .await?;
        self.subscriptions.lock().unwrap().push(task);
        Ok(())
    }

    /// Receiver for transforms pushed by [`Source::subscribe`].
    ///
    /// A subscription whose feed fails pushes the error and then stops.
    pub fn on_transform(&self) -> broadcast::Receiver<Result<Transform>> {
        self.did_transform.subscribe()
    }

    /// Run a native query and deserialize every result as `model`.
    pub async fn find(&self, model: &str, query: &Query) -> Result<Vec<Record>> {
        let docs = match self.driver.run(query).await? {
            QueryOutput::Single(doc) => doc.into_iter().collect(),
            QueryOutput::Many(docs) => docs,
        };
        docs.iter()
            .map(|doc| self.serializer.deserialize(model, doc))
            .collect()
    }

    /// Every record of `model`.
    pub async fn find_by_type(&self, model: &str) -> Result<Vec<Record>> {
        let query = Query::table(self.serializer.table_name(model));
        self.find(model, &query).await
    }
}

impl<D: Driver> Drop for Source<D> {
    fn drop(&mut self) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            for task in subscriptions.drain(..) {
                task.abort();
            }
        }
    }
}
