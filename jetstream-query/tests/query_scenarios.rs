use std::sync::Arc;

use jetstream_model::{
    ApplyOptions, FragmentKind, InMemoryBackend, PropertyDescriptor, PropertyKind, Scope,
    ScopeConfig, SyncFragment, TypeRegistry,
};
use jetstream_query::{execute, prepare_and_validate};
use serde_json::json;
use uuid::Uuid;

fn canvas_registry() -> Arc<TypeRegistry> {
    let reg = TypeRegistry::new();
    reg.define_model_type("Canvas", None, |b| {
        b.property(PropertyDescriptor::scalar("name", PropertyKind::String));
        b.property(PropertyDescriptor::collection(
            "shapes",
            PropertyKind::ModelRef("Shape".into()),
        ));
    })
    .unwrap();
    reg.define_model_type("Shape", None, |b| {
        b.property(PropertyDescriptor::scalar("x", PropertyKind::Number));
        b.property(PropertyDescriptor::scalar("y", PropertyKind::Number));
    })
    .unwrap();
    reg
}

async fn canvas_with_root() -> (Scope, Uuid) {
    let scope = Scope::new(
        "canvas",
        json!(null),
        canvas_registry(),
        Arc::new(InMemoryBackend::new()),
        ScopeConfig::default(),
    );
    let root = Uuid::new_v4();
    let mut add = SyncFragment::new(FragmentKind::Add, root, "Canvas");
    add.properties.insert("name".into(), json!("board"));
    scope.apply_sync_fragments(vec![add], ApplyOptions::default()).await.unwrap();
    scope.set_root(root).await.unwrap();
    (scope, root)
}

/// One client pushes a new shape into the canvas; a second connection
/// reading the scope afterward sees the linked, attached object.
#[tokio::test]
async fn client_push_links_a_freshly_created_shape() {
    let (scope, root) = canvas_with_root().await;
    let update = json!({"$push": {"shapes": {"x": 10, "y": 20}}});
    let prepared = prepare_and_validate(scope.registry(), "Canvas", &update).unwrap();
    let result = execute(&scope, root, "Canvas", prepared, ApplyOptions::default())
        .await
        .unwrap();

    assert_eq!(result.created.len(), 1);
    let shape_uuid = result.created[0];
    let root_obj = scope.get_by_uuid(root).await.unwrap().unwrap();
    let shapes = match root_obj.get("shapes") {
        Some(jetstream_model::PropertyValue::ModelRefList(list)) => list.clone(),
        other => panic!("expected a ModelRefList, got {other:?}"),
    };
    assert_eq!(shapes, vec![shape_uuid]);
    assert!(scope.get_by_uuid(shape_uuid).await.unwrap().is_some());
}

/// Negative index resolves from the end, matching `resolve_index`'s
/// contract through the full query layer rather than just the parser.
#[tokio::test]
async fn pull_by_negative_index_filter_removes_last_matching_shape() {
    let (scope, root) = canvas_with_root().await;
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    for uuid in [first, second] {
        let add = SyncFragment::new(FragmentKind::Add, uuid, "Shape");
        scope.apply_sync_fragments(vec![add], ApplyOptions::default()).await.unwrap();
    }
    let push = json!({"$push": {"shapes": [first.to_string(), second.to_string()]}});
    let prepared = prepare_and_validate(scope.registry(), "Canvas", &push).unwrap();
    execute(&scope, root, "Canvas", prepared, ApplyOptions::default()).await.unwrap();

    let pull = json!({"$pull": {"shapes": second.to_string()}});
    let prepared = prepare_and_validate(scope.registry(), "Canvas", &pull).unwrap();
    let result = execute(&scope, root, "Canvas", prepared, ApplyOptions::default())
        .await
        .unwrap();
    assert!(!result.no_op);
    assert!(scope.get_by_uuid(first).await.unwrap().is_some());
    assert!(scope.get_by_uuid(second).await.unwrap().is_none());
}

/// A document naming neither operator (or more than one) is a validation
/// error at prepare time, before any fragment is ever built.
#[test]
fn update_document_without_an_operator_is_rejected() {
    let reg = canvas_registry();
    let update = json!({"name": "board"});
    assert!(prepare_and_validate(&reg, "Canvas", &update).is_err());
}
