//! Graphfeed-State: document-store drivers for graphfeed
//!
//! This crate provides the persistence layer the sync engine writes to and
//! listens on. It owns every round-trip to the database.
//!
//! ## Key Components
//!
//! - `Driver`: table-scoped CRUD, one-shot queries and changefeeds
//! - `Query` / `Predicate` / `Selector`: native query AST executed by drivers
//! - `SurrealDriver`: SurrealDB backend (`LIVE SELECT` changefeeds)
//! - `fakes::MemoryDriver`: in-memory backend for tests and local tooling

pub mod driver;
mod error;
pub mod fakes;
pub mod query;
mod surreal;

pub use driver::{
    Change, ChangeCursor, ChangeOptions, Driver, FeedState, StorageResult,
};
pub use error::StorageError;
pub use query::{
    apply_updates, document_id, id_to_string, is_truthy, Document, FieldUpdate, Predicate, Query,
    QueryOutput, Selector, Term, ID_FIELD,
};
pub use surreal::{Credentials, SurrealConfig, SurrealDriver};
