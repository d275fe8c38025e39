//! GraphFeed Core Library
//!
//! Bridges a record-graph data model to a document store with changefeeds:
//! transforms are planned into storage writes, and live queries turn
//! changefeed events back into graph operations.

pub mod dao;
pub mod error;
pub mod live;
pub mod metrics;
pub mod obs;
pub mod operation;
pub mod oql;
pub mod record;
pub mod schema;
pub mod serializer;
pub mod source;
pub mod subscriber;
pub mod telemetry;
pub mod transformations;
pub mod transformer;

pub use telemetry::init_tracing;

pub use error::{Result, SyncError};

pub use live::{
    CancelHandle, LiveQuery, LiveQueryState, OperationBroadcast, OperationStream,
    PendingLiveQuery, ReplayPolicy,
};

pub use operation::{Operation, RawOperation, Transform};
pub use oql::{CompiledQuery, EvalContext, Expression, Fragment, Operator, QueryEvaluator};
pub use record::{Record, RecordIdentity, RelationshipRef};
pub use schema::{
    AttributeDefinition, ModelDefinition, RelationshipDefinition, RelationshipKind, Schema,
    SchemaDefinition,
};
pub use serializer::Serializer;
pub use source::{Source, SourceConfig};
pub use subscriber::{diff_records, process_change, QueryResult, SourceQuery, Subscriber};
pub use transformations::{
    lookup_transformation, DateTransformation, IdentityTransformation, Transformation,
};
pub use transformer::Transformer;

pub use dao::RelationDao;
