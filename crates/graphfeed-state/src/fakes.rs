//! In-memory fake driver (testing only)
//!
//! Provides `MemoryDriver`, which satisfies the `Driver` contract without any
//! external dependencies. Semantics follow a RethinkDB-style document store:
//! inserts conflict on duplicate ids, updates of missing ids are no-ops, and
//! each table broadcasts its changes to open feeds.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::driver::*;
use crate::error::StorageError;
use crate::query::{apply_updates, document_id, Document, FieldUpdate, Query, QueryOutput, Selector};

const DEFAULT_FEED_CAPACITY: usize = 1024;

/// A document-level change as seen by a table, before query projection.
#[derive(Debug, Clone)]
struct TableEvent {
    old: Option<Document>,
    new: Option<Document>,
}

#[derive(Debug)]
struct Table {
    docs: BTreeMap<String, Document>,
    feed: broadcast::Sender<TableEvent>,
}

impl Table {
    fn new(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity);
        Self {
            docs: BTreeMap::new(),
            feed,
        }
    }

    fn publish(&self, old: Option<Document>, new: Option<Document>) {
        // No open feeds is not an error.
        let _ = self.feed.send(TableEvent { old, new });
    }
}

/// In-memory document store backed by `HashMap<table, Table>`.
///
/// Tables are created on first use.
#[derive(Debug)]
pub struct MemoryDriver {
    tables: Mutex<HashMap<String, Table>>,
    feed_capacity: usize,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a driver with the given tables already present.
    pub fn with_tables(names: &[&str]) -> Self {
        let driver = Self::new();
        for name in names {
            driver.create_table(name);
        }
        driver
    }

    /// Bound on buffered, unconsumed changes per feed.
    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity.max(1);
        self
    }

    pub fn create_table(&self, name: &str) {
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry(name.to_string())
            .or_insert_with(|| Table::new(self.feed_capacity));
    }

    /// Snapshot of every document in a table, ordered by id.
    pub fn documents(&self, table: &str) -> Vec<Document> {
        let tables = self.tables.lock().unwrap();
        tables
            .get(table)
            .map(|t| t.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of one document.
    pub fn document(&self, table: &str, id: &str) -> Option<Document> {
        let tables = self.tables.lock().unwrap();
        tables.get(table).and_then(|t| t.docs.get(id).cloned())
    }

    fn with_table<T>(&self, name: &str, f: impl FnOnce(&mut Table) -> T) -> T {
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .entry(name.to_string())
            .or_insert_with(|| Table::new(self.feed_capacity));
        f(table)
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn insert(&self, table: &str, doc: Document) -> StorageResult<()> {
        let id = document_id(&doc).ok_or_else(|| {
            StorageError::Query(format!("document inserted into `{table}` has no id"))
        })?;
        self.with_table(table, |t| {
            if t.docs.contains_key(&id) {
                return Err(StorageError::Conflict {
                    table: table.to_string(),
                    id,
                });
            }
            t.docs.insert(id, doc.clone());
            t.publish(None, Some(doc));
            Ok(())
        })
    }

    async fn get(&self, table: &str, id: &str) -> StorageResult<Option<Document>> {
        Ok(self.with_table(table, |t| t.docs.get(id).cloned()))
    }

    async fn update(
        &self,
        table: &str,
        selector: Selector,
        updates: Vec<FieldUpdate>,
    ) -> StorageResult<u64> {
        Ok(self.with_table(table, |t| {
            let mut changed = Vec::new();
            for doc in t.docs.values_mut().filter(|doc| selector.selects(doc)) {
                let old = doc.clone();
                if apply_updates(doc, &updates) {
                    changed.push((old, doc.clone()));
                }
            }
            let count = changed.len() as u64;
            for (old, new) in changed {
                t.publish(Some(old), Some(new));
            }
            count
        }))
    }

    async fn delete(&self, table: &str, id: &str) -> StorageResult<()> {
        self.with_table(table, |t| {
            if let Some(old) = t.docs.remove(id) {
                t.publish(Some(old), None);
            }
        });
        Ok(())
    }

    async fn run(&self, query: &Query) -> StorageResult<QueryOutput> {
        Ok(self.with_table(query.table_name(), |t| match query {
            Query::Get { id, .. } => QueryOutput::Single(t.docs.get(id).cloned()),
            _ => QueryOutput::Many(
                t.docs
                    .values()
                    .filter(|doc| query.matches(doc))
                    .cloned()
                    .collect(),
            ),
        }))
    }

    async fn changes(&self, query: &Query, options: ChangeOptions) -> StorageResult<ChangeCursor> {
        // Snapshot and subscribe under one lock so no change falls between them.
        let (initial, receiver) = self.with_table(query.table_name(), |t| {
            let initial: Vec<Document> = t
                .docs
                .values()
                .filter(|doc| query.matches(doc))
                .cloned()
                .collect();
            (initial, t.feed.subscribe())
        });

        let mut head: Vec<StorageResult<Change>> = Vec::new();
        if options.include_states {
            head.push(Ok(Change::State(FeedState::Initializing)));
        }
        if options.include_initial {
            head.extend(initial.into_iter().map(|doc| Ok(Change::insert(doc))));
        }
        if options.include_states {
            head.push(Ok(Change::State(FeedState::Ready)));
        }

        let query = query.clone();
        let tail = futures::stream::unfold(receiver, move |mut receiver| {
            let query = query.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            if let Some(change) =
                                Change::project(&query, event.old.as_ref(), event.new.as_ref())
                            {
                                return Some((Ok(change), receiver));
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            let err = StorageError::Changefeed(format!(
                                "feed fell behind by {skipped} changes"
                            ));
                            return Some((Err(err), receiver));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(futures::stream::iter(head).chain(tail).boxed())
    }

    async fn table_of(&self, query: &Query) -> StorageResult<String> {
        Ok(query.table_name().to_string())
    }

    async fn list_tables(&self) -> StorageResult<Vec<String>> {
        let tables = self.tables.lock().unwrap();
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
