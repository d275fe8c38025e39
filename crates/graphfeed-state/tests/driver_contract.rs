//! Driver contract tests.
//!
//! These tests verify the behavioral contract of `Driver` using the
//! in-memory fake. Any conforming implementation must pass these.

use std::time::Duration;

use futures::StreamExt;
use graphfeed_state::fakes::MemoryDriver;
use graphfeed_state::*;
use serde_json::{json, Value};

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

async fn next_change(cursor: &mut ChangeCursor) -> Change {
    tokio::time::timeout(Duration::from_secs(1), cursor.next())
        .await
        .expect("timed out waiting for change")
        .expect("cursor ended")
        .expect("cursor error")
}

// ===========================================================================
// CRUD
// ===========================================================================

#[tokio::test]
async fn insert_then_get_round_trip() {
    let driver = MemoryDriver::new();
    driver
        .insert("messages", doc(json!({"id": "m1", "body": "hello"})))
        .await
        .unwrap();

    let loaded = driver.get("messages", "m1").await.unwrap().unwrap();
    assert_eq!(loaded["body"], json!("hello"));
}

#[tokio::test]
async fn insert_duplicate_id_conflicts() {
    let driver = MemoryDriver::new();
    driver
        .insert("messages", doc(json!({"id": "m1"})))
        .await
        .unwrap();
    let err = driver
        .insert("messages", doc(json!({"id": "m1"})))
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::Conflict { .. }));
}

#[tokio::test]
async fn insert_without_id_is_rejected() {
    let driver = MemoryDriver::new();
    let err = driver
        .insert("messages", doc(json!({"body": "anonymous"})))
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::Query(_)));
}

#[tokio::test]
async fn update_missing_id_is_noop() {
    let driver = MemoryDriver::new();
    let count = driver
        .update(
            "messages",
            Selector::Id("ghost".into()),
            vec![FieldUpdate::set("body", json!("boo"))],
        )
        .await
        .unwrap();

    assert_eq!(count, 0);
    assert!(driver.get("messages", "ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn update_by_ids_and_predicate() {
    let driver = MemoryDriver::new();
    for id in ["u1", "u2", "u3"] {
        driver
            .insert("users", doc(json!({"id": id, "chatRoomIds": {"c1": true}})))
            .await
            .unwrap();
    }

    let count = driver
        .update(
            "users",
            Selector::Ids(vec!["u1".into(), "u2".into()]),
            vec![FieldUpdate::insert_key("chatRoomIds", "c2")],
        )
        .await
        .unwrap();
    assert_eq!(count, 2);

    let count = driver
        .update(
            "users",
            Selector::Where(Predicate::Contains {
                field: "chatRoomIds".into(),
                key: "c1".into(),
            }),
            vec![FieldUpdate::remove_key("chatRoomIds", "c1")],
        )
        .await
        .unwrap();
    assert_eq!(count, 3);

    assert_eq!(driver.document("users", "u1").unwrap()["chatRoomIds"], json!({"c2": true}));
    assert_eq!(driver.document("users", "u3").unwrap()["chatRoomIds"], json!({}));
}

#[tokio::test]
async fn delete_removes_and_tolerates_missing() {
    let driver = MemoryDriver::new();
    driver
        .insert("messages", doc(json!({"id": "m1"})))
        .await
        .unwrap();

    driver.delete("messages", "m1").await.unwrap();
    driver.delete("messages", "m1").await.unwrap();
    assert!(driver.get("messages", "m1").await.unwrap().is_none());
}

// ===========================================================================
// Queries
// ===========================================================================

#[tokio::test]
async fn run_point_lookup_and_filter() {
    let driver = MemoryDriver::new();
    driver
        .insert("messages", doc(json!({"id": "m1", "author": "jim"})))
        .await
        .unwrap();
    driver
        .insert("messages", doc(json!({"id": "m2", "author": "pam"})))
        .await
        .unwrap();

    let single = driver.run(&Query::get("messages", "m2")).await.unwrap();
    assert!(matches!(single, QueryOutput::Single(Some(ref d)) if d["author"] == json!("pam")));

    let missing = driver.run(&Query::get("messages", "m9")).await.unwrap();
    assert_eq!(missing, QueryOutput::Single(None));

    let filtered = driver
        .run(&Query::table("messages").filter(Predicate::Eq(
            Term::Field("author".into()),
            Term::Literal(json!("jim")),
        )))
        .await
        .unwrap();
    match filtered {
        QueryOutput::Many(docs) => {
            assert_eq!(docs.len(), 1);
            assert_eq!(docs[0]["id"], json!("m1"));
        }
        other => panic!("expected many, got {other:?}"),
    }
}

#[tokio::test]
async fn table_introspection() {
    let driver = MemoryDriver::with_tables(&["users", "chat_rooms"]);
    let query = Query::table("chat_rooms").filter(Predicate::Const(true));

    assert_eq!(driver.table_of(&query).await.unwrap(), "chat_rooms");
    assert_eq!(driver.list_tables().await.unwrap(), vec!["chat_rooms", "users"]);
}

// ===========================================================================
// Changefeeds
// ===========================================================================

#[tokio::test]
async fn changes_replay_initial_then_ready_then_live() {
    let driver = MemoryDriver::new();
    driver
        .insert("messages", doc(json!({"id": "m1", "body": "Hello"})))
        .await
        .unwrap();

    let mut cursor = driver
        .changes(&Query::table("messages"), ChangeOptions::default())
        .await
        .unwrap();

    assert_eq!(next_change(&mut cursor).await, Change::State(FeedState::Initializing));
    assert_eq!(
        next_change(&mut cursor).await,
        Change::insert(doc(json!({"id": "m1", "body": "Hello"})))
    );
    assert_eq!(next_change(&mut cursor).await, Change::State(FeedState::Ready));

    driver
        .update(
            "messages",
            Selector::Id("m1".into()),
            vec![FieldUpdate::set("body", json!("Goodbye"))],
        )
        .await
        .unwrap();
    assert_eq!(
        next_change(&mut cursor).await,
        Change::update(
            doc(json!({"id": "m1", "body": "Hello"})),
            doc(json!({"id": "m1", "body": "Goodbye"}))
        )
    );

    driver.delete("messages", "m1").await.unwrap();
    assert_eq!(
        next_change(&mut cursor).await,
        Change::remove(doc(json!({"id": "m1", "body": "Goodbye"})))
    );
}

#[tokio::test]
async fn changes_without_initial_skip_snapshot() {
    let driver = MemoryDriver::new();
    driver
        .insert("messages", doc(json!({"id": "m1"})))
        .await
        .unwrap();

    let options = ChangeOptions {
        include_initial: false,
        ..ChangeOptions::default()
    };
    let mut cursor = driver
        .changes(&Query::table("messages"), options)
        .await
        .unwrap();

    assert_eq!(next_change(&mut cursor).await, Change::State(FeedState::Initializing));
    assert_eq!(next_change(&mut cursor).await, Change::State(FeedState::Ready));
}

#[tokio::test]
async fn filtered_changes_report_entering_and_leaving_documents() {
    let driver = MemoryDriver::new();
    let query = Query::table("messages").filter(Predicate::Eq(
        Term::Field("chatRoomId".into()),
        Term::Literal(json!("c1")),
    ));
    let mut cursor = driver
        .changes(&query, ChangeOptions::default())
        .await
        .unwrap();
    assert_eq!(next_change(&mut cursor).await, Change::State(FeedState::Initializing));
    assert_eq!(next_change(&mut cursor).await, Change::State(FeedState::Ready));

    // Outside the result set: nothing is reported.
    driver
        .insert("messages", doc(json!({"id": "m1", "chatRoomId": null})))
        .await
        .unwrap();

    driver
        .update(
            "messages",
            Selector::Id("m1".into()),
            vec![FieldUpdate::set("chatRoomId", json!("c1"))],
        )
        .await
        .unwrap();
    assert_eq!(
        next_change(&mut cursor).await,
        Change::insert(doc(json!({"id": "m1", "chatRoomId": "c1"})))
    );

    driver
        .update(
            "messages",
            Selector::Id("m1".into()),
            vec![FieldUpdate::set("chatRoomId", Value::Null)],
        )
        .await
        .unwrap();
    assert_eq!(
        next_change(&mut cursor).await,
        Change::remove(doc(json!({"id": "m1", "chatRoomId": "c1"})))
    );
}

#[tokio::test]
async fn lagging_feed_reports_changefeed_error() {
    let driver = MemoryDriver::new().with_feed_capacity(1);
    let options = ChangeOptions {
        include_states: false,
        ..ChangeOptions::default()
    };
    let mut cursor = driver
        .changes(&Query::table("messages"), options)
        .await
        .unwrap();

    for i in 0..3 {
        driver
            .insert("messages", doc(json!({"id": format!("m{i}")})))
            .await
            .unwrap();
    }

    let first = tokio::time::timeout(Duration::from_secs(1), cursor.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, Err(StorageError::Changefeed(_))));
}
