//! Write planner scenarios over the in-memory driver.
//!
//! Each test applies transforms through `Source::transform` and checks the
//! stored documents on both sides of every relationship.

mod common;

use common::*;
use graphfeed_core::{Operation, Record, SyncError, Transform};
use serde_json::{json, Value};

// ===========================================================================
// addRecord / removeRecord
// ===========================================================================

#[tokio::test]
async fn add_record_writes_document_and_inverse() {
    let (driver, source) = setup();
    seed(&source, vec![room("c1", "Lobby")]).await;

    let record = message("m1", "Hello").with_has_one("chatRoom", Some(identity("chatRoom", "c1")));
    seed(&source, vec![record]).await;

    assert_eq!(
        stored(&driver, "messages", "m1"),
        json!({"id": "m1", "body": "Hello", "chatRoomId": "c1"})
    );
    assert_eq!(
        stored(&driver, "chat_rooms", "c1")["messageIds"],
        json!({"m1": true})
    );
}

#[tokio::test]
async fn add_record_with_to_many_data_points_members_back() {
    let (driver, source) = setup();
    seed(
        &source,
        vec![
            room("c0", "Old"),
            message("m2", "World"),
        ],
    )
    .await;
    seed(
        &source,
        vec![message("m1", "Hello").with_has_one("chatRoom", Some(identity("chatRoom", "c0")))],
    )
    .await;

    let record = room("c1", "Lobby").with_has_many(
        "messages",
        [identity("message", "m1"), identity("message", "m2")],
    );
    seed(&source, vec![record]).await;

    assert_eq!(
        stored(&driver, "chat_rooms", "c1")["messageIds"],
        json!({"m1": true, "m2": true})
    );
    assert_eq!(stored(&driver, "messages", "m1")["chatRoomId"], json!("c1"));
    assert_eq!(stored(&driver, "messages", "m2")["chatRoomId"], json!("c1"));
    // A message belongs to one room, so the old room lets go of it.
    assert_eq!(stored(&driver, "chat_rooms", "c0")["messageIds"], json!({}));
}

#[tokio::test]
async fn add_record_with_date_attribute_stores_millis() {
    let (driver, source) = setup();
    let record = message("m1", "Hello").with_attribute("sentAt", "2024-06-01T12:00:00.000Z");
    seed(&source, vec![record]).await;

    assert_eq!(
        stored(&driver, "messages", "m1")["sentAt"],
        json!(1_717_243_200_000_i64)
    );
}

#[tokio::test]
async fn add_record_with_duplicate_id_fails() {
    let (_driver, source) = setup();
    seed(&source, vec![message("m1", "Hello")]).await;

    let err = source
        .transform(&Operation::AddRecord { record: message("m1", "Again") }.into())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Storage(_)));
}

#[tokio::test]
async fn remove_record_clears_inverse_pointers() {
    let (driver, source) = setup();
    seed(&source, vec![room("c1", "Lobby")]).await;
    seed(
        &source,
        vec![message("m1", "Hello").with_has_one("chatRoom", Some(identity("chatRoom", "c1")))],
    )
    .await;

    source
        .transform(
            &Operation::RemoveRecord {
                record: identity("message", "m1"),
            }
            .into(),
        )
        .await
        .unwrap();

    assert_eq!(stored(&driver, "messages", "m1"), Value::Null);
    assert_eq!(stored(&driver, "chat_rooms", "c1")["messageIds"], json!({}));
}

#[tokio::test]
async fn remove_room_nulls_member_pointers() {
    let (driver, source) = setup();
    seed(&source, vec![room("c1", "Lobby")]).await;
    seed(
        &source,
        vec![message("m1", "Hello").with_has_one("chatRoom", Some(identity("chatRoom", "c1")))],
    )
    .await;

    source
        .transform(
            &Operation::RemoveRecord {
                record: identity("chatRoom", "c1"),
            }
            .into(),
        )
        .await
        .unwrap();

    assert_eq!(stored(&driver, "chat_rooms", "c1"), Value::Null);
    assert_eq!(stored(&driver, "messages", "m1")["chatRoomId"], Value::Null);
}

// ===========================================================================
// replaceAttribute
// ===========================================================================

#[tokio::test]
async fn replace_attribute_updates_one_field() {
    let (driver, source) = setup();
    seed(&source, vec![message("m1", "Hello")]).await;

    source
        .transform(
            &Operation::ReplaceAttribute {
                record: identity("message", "m1"),
                attribute: "body".into(),
                value: json!("Goodbye"),
            }
            .into(),
        )
        .await
        .unwrap();

    assert_eq!(
        stored(&driver, "messages", "m1"),
        json!({"id": "m1", "body": "Goodbye"})
    );
}

// ===========================================================================
// hasOne ↔ hasMany
// ===========================================================================

#[tokio::test]
async fn replace_has_one_moves_membership_between_rooms() {
    let (driver, source) = setup();
    seed(&source, vec![room("c1", "Lobby"), room("c2", "Annex")]).await;
    seed(
        &source,
        vec![message("m1", "Hello").with_has_one("chatRoom", Some(identity("chatRoom", "c1")))],
    )
    .await;

    source
        .transform(
            &Operation::ReplaceHasOne {
                record: identity("message", "m1"),
                relationship: "chatRoom".into(),
                related: Some(identity("chatRoom", "c2")),
            }
            .into(),
        )
        .await
        .unwrap();

    assert_eq!(stored(&driver, "messages", "m1")["chatRoomId"], json!("c2"));
    assert_eq!(stored(&driver, "chat_rooms", "c1")["messageIds"], json!({}));
    assert_eq!(
        stored(&driver, "chat_rooms", "c2")["messageIds"],
        json!({"m1": true})
    );
}

#[tokio::test]
async fn replace_has_one_with_null_unlinks() {
    let (driver, source) = setup();
    seed(&source, vec![room("c1", "Lobby")]).await;
    seed(
        &source,
        vec![message("m1", "Hello").with_has_one("chatRoom", Some(identity("chatRoom", "c1")))],
    )
    .await;

    source
        .transform(
            &Operation::ReplaceHasOne {
                record: identity("message", "m1"),
                relationship: "chatRoom".into(),
                related: None,
            }
            .into(),
        )
        .await
        .unwrap();

    assert_eq!(stored(&driver, "messages", "m1")["chatRoomId"], Value::Null);
    assert_eq!(stored(&driver, "chat_rooms", "c1")["messageIds"], json!({}));
}

#[tokio::test]
async fn add_to_has_many_then_remove() {
    let (driver, source) = setup();
    seed(
        &source,
        vec![room("c1", "Lobby"), room("c2", "Annex"), message("m1", "Hello")],
    )
    .await;

    let add = |room: &str| Operation::AddToHasMany {
        record: identity("chatRoom", room),
        relationship: "messages".into(),
        related: identity("message", "m1"),
    };

    source.transform(&add("c1").into()).await.unwrap();
    assert_eq!(
        stored(&driver, "chat_rooms", "c1")["messageIds"],
        json!({"m1": true})
    );
    assert_eq!(stored(&driver, "messages", "m1")["chatRoomId"], json!("c1"));

    // Moving the message takes it out of its previous room.
    source.transform(&add("c2").into()).await.unwrap();
    assert_eq!(stored(&driver, "chat_rooms", "c1")["messageIds"], json!({}));
    assert_eq!(stored(&driver, "messages", "m1")["chatRoomId"], json!("c2"));

    source
        .transform(
            &Operation::RemoveFromHasMany {
                record: identity("chatRoom", "c2"),
                relationship: "messages".into(),
                related: identity("message", "m1"),
            }
            .into(),
        )
        .await
        .unwrap();
    assert_eq!(stored(&driver, "chat_rooms", "c2")["messageIds"], json!({}));
    assert_eq!(stored(&driver, "messages", "m1")["chatRoomId"], Value::Null);
}

#[tokio::test]
async fn remove_from_has_many_leaves_pointer_to_another_room() {
    let (driver, source) = setup();
    seed(&source, vec![room("c1", "Lobby"), room("c2", "Annex")]).await;
    seed(
        &source,
        vec![message("m1", "Hello").with_has_one("chatRoom", Some(identity("chatRoom", "c2")))],
    )
    .await;

    source
        .transform(
            &Operation::RemoveFromHasMany {
                record: identity("chatRoom", "c1"),
                relationship: "messages".into(),
                related: identity("message", "m1"),
            }
            .into(),
        )
        .await
        .unwrap();

    assert_eq!(stored(&driver, "messages", "m1")["chatRoomId"], json!("c2"));
    assert_eq!(
        stored(&driver, "chat_rooms", "c2")["messageIds"],
        json!({"m1": true})
    );
}

#[tokio::test]
async fn replace_has_many_with_to_one_inverse_detaches_members() {
    let (driver, source) = setup();
    seed(&source, vec![room("c1", "Lobby"), room("c2", "Annex")]).await;
    seed(
        &source,
        vec![
            message("m1", "Hello").with_has_one("chatRoom", Some(identity("chatRoom", "c1"))),
            message("m2", "World").with_has_one("chatRoom", Some(identity("chatRoom", "c2"))),
        ],
    )
    .await;

    source
        .transform(
            &Operation::ReplaceHasMany {
                record: identity("chatRoom", "c2"),
                relationship: "messages".into(),
                related: vec![identity("message", "m1")],
            }
            .into(),
        )
        .await
        .unwrap();

    assert_eq!(
        stored(&driver, "chat_rooms", "c2")["messageIds"],
        json!({"m1": true})
    );
    assert_eq!(stored(&driver, "chat_rooms", "c1")["messageIds"], json!({}));
    assert_eq!(stored(&driver, "messages", "m1")["chatRoomId"], json!("c2"));
    assert_eq!(stored(&driver, "messages", "m2")["chatRoomId"], Value::Null);
}

// ===========================================================================
// hasMany ↔ hasMany
// ===========================================================================

#[tokio::test]
async fn replace_has_many_rewrites_both_sides() {
    let (driver, source) = setup();
    seed(
        &source,
        vec![room("c1", "Lobby"), room("c2", "Annex"), room("c3", "Attic")],
    )
    .await;
    seed(
        &source,
        vec![
            user("u1", "Jim").with_has_many("chatRooms", [identity("chatRoom", "c1")]),
            user("u2", "Pam").with_has_many("chatRooms", [identity("chatRoom", "c2")]),
        ],
    )
    .await;

    source
        .transform(
            &Operation::ReplaceHasMany {
                record: identity("user", "u1"),
                relationship: "chatRooms".into(),
                related: vec![identity("chatRoom", "c2"), identity("chatRoom", "c3")],
            }
            .into(),
        )
        .await
        .unwrap();

    assert_eq!(
        stored(&driver, "users", "u1")["chatRoomIds"],
        json!({"c2": true, "c3": true})
    );
    assert_eq!(stored(&driver, "chat_rooms", "c1")["userIds"], json!({}));
    assert_eq!(
        stored(&driver, "chat_rooms", "c2")["userIds"],
        json!({"u1": true, "u2": true})
    );
    assert_eq!(
        stored(&driver, "chat_rooms", "c3")["userIds"],
        json!({"u1": true})
    );
    // Other users keep their own memberships.
    assert_eq!(
        stored(&driver, "users", "u2")["chatRoomIds"],
        json!({"c2": true})
    );
}

#[tokio::test]
async fn replace_has_many_with_empty_list_clears_both_sides() {
    let (driver, source) = setup();
    seed(&source, vec![room("c1", "Lobby")]).await;
    seed(
        &source,
        vec![user("u1", "Jim").with_has_many("chatRooms", [identity("chatRoom", "c1")])],
    )
    .await;

    source
        .transform(
            &Operation::ReplaceHasMany {
                record: identity("user", "u1"),
                relationship: "chatRooms".into(),
                related: vec![],
            }
            .into(),
        )
        .await
        .unwrap();

    assert_eq!(stored(&driver, "users", "u1")["chatRoomIds"], json!({}));
    assert_eq!(stored(&driver, "chat_rooms", "c1")["userIds"], json!({}));
}

#[tokio::test]
async fn add_to_many_to_many_keeps_other_members() {
    let (driver, source) = setup();
    seed(&source, vec![room("c1", "Lobby"), user("u1", "Jim"), user("u2", "Pam")]).await;

    for user_id in ["u1", "u2"] {
        source
            .transform(
                &Operation::AddToHasMany {
                    record: identity("user", user_id),
                    relationship: "chatRooms".into(),
                    related: identity("chatRoom", "c1"),
                }
                .into(),
            )
            .await
            .unwrap();
    }

    assert_eq!(
        stored(&driver, "chat_rooms", "c1")["userIds"],
        json!({"u1": true, "u2": true})
    );
    assert_eq!(
        stored(&driver, "users", "u1")["chatRoomIds"],
        json!({"c1": true})
    );
}

// ===========================================================================
// hasOne ↔ hasOne
// ===========================================================================

#[tokio::test]
async fn replace_has_one_to_one_steals_from_previous_holder() {
    let (driver, source) = setup();
    seed(
        &source,
        vec![
            user("u1", "Jim"),
            user("u2", "Pam"),
            Record::new("alterEgo", "a1").with_attribute("name", "Dwight"),
        ],
    )
    .await;

    let point = |user_id: &str| Operation::ReplaceHasOne {
        record: identity("user", user_id),
        relationship: "alterEgo".into(),
        related: Some(identity("alterEgo", "a1")),
    };

    source.transform(&point("u1").into()).await.unwrap();
    assert_eq!(stored(&driver, "users", "u1")["alterEgoId"], json!("a1"));
    assert_eq!(stored(&driver, "alter_egos", "a1")["userId"], json!("u1"));

    source.transform(&point("u2").into()).await.unwrap();
    assert_eq!(stored(&driver, "users", "u1")["alterEgoId"], Value::Null);
    assert_eq!(stored(&driver, "users", "u2")["alterEgoId"], json!("a1"));
    assert_eq!(stored(&driver, "alter_egos", "a1")["userId"], json!("u2"));
}

#[tokio::test]
async fn add_record_to_one_steals_from_previous_holder() {
    let (driver, source) = setup();
    seed(
        &source,
        vec![
            Record::new("alterEgo", "a1").with_attribute("name", "Dwight"),
            user("u1", "Jim").with_has_one("alterEgo", Some(identity("alterEgo", "a1"))),
        ],
    )
    .await;
    assert_eq!(stored(&driver, "alter_egos", "a1")["userId"], json!("u1"));

    seed(
        &source,
        vec![user("u2", "Pam").with_has_one("alterEgo", Some(identity("alterEgo", "a1")))],
    )
    .await;

    assert_eq!(stored(&driver, "users", "u1")["alterEgoId"], Value::Null);
    assert_eq!(stored(&driver, "users", "u2")["alterEgoId"], json!("a1"));
    assert_eq!(stored(&driver, "alter_egos", "a1")["userId"], json!("u2"));
}

// ===========================================================================
// Failure
// ===========================================================================

#[tokio::test]
async fn failed_operation_stops_the_transform() {
    let (driver, source) = setup();
    seed(&source, vec![message("m1", "Hello")]).await;

    let transform = Transform::new(vec![
        Operation::ReplaceHasOne {
            record: identity("message", "m1"),
            relationship: "sender".into(),
            related: Some(identity("user", "u1")),
        },
        Operation::ReplaceAttribute {
            record: identity("message", "m1"),
            attribute: "body".into(),
            value: json!("never written"),
        },
    ]);

    let err = source.transform(&transform).await.unwrap_err();

    assert!(matches!(err, SyncError::UnknownRelationship { .. }));
    assert_eq!(stored(&driver, "messages", "m1")["body"], json!("Hello"));
}

#[tokio::test]
async fn unknown_model_is_rejected() {
    let (_driver, source) = setup();
    let err = source
        .transform(
            &Operation::ReplaceAttribute {
                record: identity("ghost", "g1"),
                attribute: "name".into(),
                value: json!("boo"),
            }
            .into(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::UnknownModel(_)));
}

#[tokio::test]
async fn transforms_decode_from_raw_operations() {
    let (driver, source) = setup();
    seed(&source, vec![room("c1", "Lobby"), message("m1", "Hello")]).await;

    let transform: Transform = serde_json::from_value(json!({
        "operations": [
            {"op": "replace", "path": "message/m1/attributes/body", "value": "Goodbye"},
            {"op": "replace", "path": "message/m1/relationships/chatRoom/data", "value": "chatRoom:c1"}
        ]
    }))
    .unwrap();
    source.transform(&transform).await.unwrap();

    assert_eq!(
        stored(&driver, "messages", "m1"),
        json!({"id": "m1", "body": "Goodbye", "chatRoomId": "c1"})
    );
    assert_eq!(
        stored(&driver, "chat_rooms", "c1")["messageIds"],
        json!({"m1": true})
    );
}
