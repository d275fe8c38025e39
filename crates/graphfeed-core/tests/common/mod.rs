//! Shared fixtures: the chat schema and a source over the in-memory driver.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use graphfeed_core::{Operation, OperationStream, Record, RecordIdentity, SchemaDefinition, Source};
use graphfeed_state::fakes::MemoryDriver;
use serde_json::{json, Value};

/// message ↔ chatRoom (hasOne ↔ hasMany), user ↔ chatRoom (hasMany ↔
/// hasMany), user ↔ alterEgo (hasOne ↔ hasOne).
pub fn chat_schema() -> SchemaDefinition {
    SchemaDefinition::from_value(json!({
        "models": {
            "message": {
                "attributes": {
                    "body": {"type": "string"},
                    "sentAt": {"type": "date"}
                },
                "relationships": {
                    "chatRoom": {"type": "hasOne", "model": "chatRoom", "inverse": "messages"}
                }
            },
            "chatRoom": {
                "attributes": {"name": {"type": "string"}},
                "relationships": {
                    "messages": {"type": "hasMany", "model": "message", "inverse": "chatRoom"},
                    "users": {"type": "hasMany", "model": "user", "inverse": "chatRooms"}
                }
            },
            "user": {
                "attributes": {"name": {"type": "string"}},
                "relationships": {
                    "chatRooms": {"type": "hasMany", "model": "chatRoom", "inverse": "users"},
                    "alterEgo": {"type": "hasOne", "model": "alterEgo", "inverse": "user"}
                }
            },
            "alterEgo": {
                "attributes": {"name": {"type": "string"}},
                "relationships": {
                    "user": {"type": "hasOne", "model": "user", "inverse": "alterEgo"}
                }
            }
        }
    }))
    .expect("chat schema")
}

pub fn setup() -> (Arc<MemoryDriver>, Source<MemoryDriver>) {
    let driver = Arc::new(MemoryDriver::with_tables(&[
        "messages",
        "chat_rooms",
        "users",
        "alter_egos",
    ]));
    let source = Source::new(Arc::clone(&driver), Arc::new(chat_schema()));
    (driver, source)
}

pub fn identity(model: &str, id: &str) -> RecordIdentity {
    RecordIdentity::new(model, id)
}

pub fn room(id: &str, name: &str) -> Record {
    Record::new("chatRoom", id).with_attribute("name", name)
}

pub fn user(id: &str, name: &str) -> Record {
    Record::new("user", id).with_attribute("name", name)
}

pub fn message(id: &str, body: &str) -> Record {
    Record::new("message", id).with_attribute("body", body)
}

/// Apply each record as its own `addRecord` transform.
pub async fn seed(source: &Source<MemoryDriver>, records: Vec<Record>) {
    for record in records {
        source
            .transform(&Operation::AddRecord { record }.into())
            .await
            .expect("seed record");
    }
}

/// Stored document as JSON, or `null` if absent.
pub fn stored(driver: &MemoryDriver, table: &str, id: &str) -> Value {
    driver
        .document(table, id)
        .map(Value::Object)
        .unwrap_or(Value::Null)
}

pub async fn next_operation(stream: &mut OperationStream) -> Operation {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for operation")
        .expect("stream ended")
        .expect("stream error")
}
