//! Driver trait definition for graphfeed
//!
//! The `Driver` trait is the document-store contract the sync engine
//! consumes:
//! - table-scoped CRUD (`insert`, `get`, `update`, `delete`)
//! - one-shot query execution (`run`)
//! - change notification (`changes`)
//! - table-name introspection (`table_of`, `list_tables`)
//!
//! The trait is async and backend-agnostic. An in-memory implementation is
//! provided for testing via the `fakes` module.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::query::{Document, FieldUpdate, Query, QueryOutput, Selector};

/// Result type for driver operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Changefeed request options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOptions {
    /// Collapse bursts of changes to one document into one event
    pub squash: bool,
    /// Emit `initializing` / `ready` state markers
    pub include_states: bool,
    /// Replay the current result set as insert events before `ready`
    pub include_initial: bool,
}

impl Default for ChangeOptions {
    fn default() -> Self {
        Self {
            squash: false,
            include_states: true,
            include_initial: true,
        }
    }
}

/// State marker carried by a changefeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Initializing,
    Ready,
}

/// A single changefeed event.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    State(FeedState),
    Document {
        old_val: Option<Document>,
        new_val: Option<Document>,
    },
}

impl Change {
    pub fn insert(doc: Document) -> Self {
        Change::Document {
            old_val: None,
            new_val: Some(doc),
        }
    }

    pub fn update(old: Document, new: Document) -> Self {
        Change::Document {
            old_val: Some(old),
            new_val: Some(new),
        }
    }

    pub fn remove(doc: Document) -> Self {
        Change::Document {
            old_val: Some(doc),
            new_val: None,
        }
    }

    /// Narrow a table-level change to a query's result set.
    ///
    /// A document leaving the result set is reported as a removal, one
    /// entering it as an insert; changes outside it yield `None`.
    pub fn project(query: &Query, old: Option<&Document>, new: Option<&Document>) -> Option<Self> {
        let old_val = old.filter(|doc| query.matches(doc)).cloned();
        let new_val = new.filter(|doc| query.matches(doc)).cloned();
        if old_val.is_none() && new_val.is_none() {
            return None;
        }
        Some(Change::Document { old_val, new_val })
    }
}

/// Stream of changefeed events. Dropping it releases the feed.
pub type ChangeCursor = BoxStream<'static, StorageResult<Change>>;

/// Document-store driver.
///
/// Guarantees:
/// - `insert` fails with `StorageError::Conflict` if the id exists.
/// - `update` of ids that do not exist is a no-op, not an error.
/// - `changes` with `include_initial` yields the current result set as
///   insert events, then `FeedState::Ready`, then live changes, with no gap
///   between the snapshot and the live tail.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Insert a new document into `table`.
    async fn insert(&self, table: &str, doc: Document) -> StorageResult<()>;

    /// Fetch one document by id.
    async fn get(&self, table: &str, id: &str) -> StorageResult<Option<Document>>;

    /// Apply field updates to every selected document; returns how many changed.
    async fn update(
        &self,
        table: &str,
        selector: Selector,
        updates: Vec<FieldUpdate>,
    ) -> StorageResult<u64>;

    /// Delete a document by id. No-op if absent.
    async fn delete(&self, table: &str, id: &str) -> StorageResult<()>;

    /// Run a query once.
    async fn run(&self, query: &Query) -> StorageResult<QueryOutput>;

    /// Open a changefeed over the query's result set.
    async fn changes(&self, query: &Query, options: ChangeOptions) -> StorageResult<ChangeCursor>;

    /// Name of the table a query reads from (`query.info()`).
    async fn table_of(&self, query: &Query) -> StorageResult<String>;

    /// Names of all tables.
    async fn list_tables(&self) -> StorageResult<Vec<String>>;
}
