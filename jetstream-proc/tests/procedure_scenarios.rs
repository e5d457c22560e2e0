//! End-to-end procedure scenario (spec §8 S5): a `ChatRoom.postMessage`
//! procedure with constraints that reject an incomplete batch and invoke a
//! remote call with expression substitution on a well-formed one.

use std::sync::Arc;

use jetstream_model::{
    ApplyOptions, FragmentKind, InMemoryBackend, PropertyDescriptor, PropertyKind, Scope, ScopeConfig, SyncFragment,
    TypeRegistry,
};
use jetstream_proc::{
    apply_and_execute, Constraint, ExecOptions, NoopHttpClient, ProcError, Procedure, ProcedureRegistry,
    PropertyCondition, RawTemplateValue, RemoteCallTemplate,
};
use serde_json::json;
use uuid::Uuid;

fn registry() -> Arc<TypeRegistry> {
    let reg = TypeRegistry::new();
    reg.define_model_type("ChatRoom", None, |b| {
        b.property(PropertyDescriptor::scalar("name", PropertyKind::String));
        b.property(PropertyDescriptor::collection("messages", PropertyKind::ModelRef("Message".into())));
    })
    .unwrap();
    reg.define_model_type("Message", None, |b| {
        b.property(PropertyDescriptor::scalar("author", PropertyKind::String));
        b.property(PropertyDescriptor::scalar("postedAt", PropertyKind::String));
        b.property(PropertyDescriptor::scalar("text", PropertyKind::String));
    })
    .unwrap();
    Arc::new(reg)
}

fn post_message_procedure() -> Procedure {
    let constraints = vec![
        Constraint::new(FragmentKind::Change, "ChatRoom").property("messages", PropertyCondition::ArrayInsert),
        Constraint::new(FragmentKind::Add, "Message")
            .property("author", PropertyCondition::HasNewValue)
            .property("postedAt", PropertyCondition::HasNewValue)
            .property("text", PropertyCondition::HasNewValue)
            .deny_additional_properties(),
    ];
    let template = RemoteCallTemplate::build(
        "https://example.test/rooms/demo/messages",
        "POST",
        vec![],
        vec![("x-room".to_string(), RawTemplateValue::Literal(json!("demo")))],
        vec![
            ("author".to_string(), RawTemplateValue::Expr("$incoming.Message.add.author".into())),
            ("postedAt".to_string(), RawTemplateValue::Expr("$incoming.Message.add.postedAt".into())),
            ("text".to_string(), RawTemplateValue::Expr("$incoming.Message.add.text".into())),
        ],
    )
    .unwrap();
    Procedure::new("ChatRoom", "postMessage", constraints, template)
}

async fn new_scope_with_room() -> (Scope, Uuid) {
    let scope = Scope::new(
        "chat",
        serde_json::Value::Null,
        registry(),
        Arc::new(InMemoryBackend::new()),
        ScopeConfig::default(),
    );
    let room_uuid = Uuid::new_v4();
    let mut room_add = SyncFragment::new(FragmentKind::Add, room_uuid, "ChatRoom");
    room_add.properties.insert("name".into(), json!("general"));
    room_add.properties.insert("messages".into(), json!([]));
    scope.apply_sync_fragments(vec![room_add], ApplyOptions::default()).await.unwrap();
    scope.set_root(room_uuid).await.unwrap();
    (scope, room_uuid)
}

#[tokio::test]
async fn incomplete_batch_fails_the_constraint() {
    let (scope, room_uuid) = new_scope_with_room().await;
    let procedures = ProcedureRegistry::new();
    procedures.register(post_message_procedure());
    let http = NoopHttpClient::new();

    let message_uuid = Uuid::new_v4();
    let mut room_change = SyncFragment::new(FragmentKind::Change, room_uuid, "ChatRoom");
    room_change.properties.insert("messages".into(), json!([message_uuid.to_string()]));
    let mut message_add = SyncFragment::new(FragmentKind::Add, message_uuid, "Message");
    message_add.properties.insert("author".into(), json!("alice"));
    message_add.properties.insert("postedAt".into(), json!("2026-07-28T00:00:00Z"));
    // `text` is deliberately omitted.

    let err = apply_and_execute(
        &scope,
        &procedures,
        "ChatRoom.postMessage",
        vec![room_change, message_add],
        ApplyOptions { atomic: true, context: None },
        &ExecOptions::default(),
        &http,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ProcError::ConstraintMismatch(name) if name == "ChatRoom.postMessage"));
    assert!(http.calls().is_empty());
}

#[tokio::test]
async fn well_formed_batch_invokes_remote_call_with_substitutions() {
    let (scope, room_uuid) = new_scope_with_room().await;
    let procedures = ProcedureRegistry::new();
    procedures.register(post_message_procedure());
    let http = NoopHttpClient::new();

    let message_uuid = Uuid::new_v4();
    let mut room_change = SyncFragment::new(FragmentKind::Change, room_uuid, "ChatRoom");
    room_change.properties.insert("messages".into(), json!([message_uuid.to_string()]));
    let mut message_add = SyncFragment::new(FragmentKind::Add, message_uuid, "Message");
    message_add.properties.insert("author".into(), json!("alice"));
    message_add.properties.insert("postedAt".into(), json!("2026-07-28T00:00:00Z"));
    message_add.properties.insert("text".into(), json!("hello room"));

    let outcome = apply_and_execute(
        &scope,
        &procedures,
        "ChatRoom.postMessage",
        vec![room_change, message_add],
        ApplyOptions { atomic: true, context: None },
        &ExecOptions::default(),
        &http,
    )
    .await
    .unwrap();

    assert!(outcome.fragment_outcomes.iter().all(|o| o.is_ok()));
    let calls = http.calls();
    assert_eq!(calls.len(), 1);
    let call = &calls[0];
    assert_eq!(call.url, "https://example.test/rooms/demo/messages");
    assert_eq!(call.body.get("author").unwrap(), "alice");
    assert_eq!(call.body.get("text").unwrap(), "hello room");
    assert!(call.headers.iter().any(|(k, v)| k == "x-room" && v == "demo"));

    let room = scope.get_by_uuid(room_uuid).await.unwrap().unwrap();
    assert!(matches!(
        room.get("messages"),
        Some(jetstream_model::PropertyValue::ModelRefList(list)) if list.contains(&message_uuid)
    ));
}
