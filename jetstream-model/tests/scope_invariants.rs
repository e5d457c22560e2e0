//! Cross-type scenarios exercising spec §8's testable properties against
//! the model/scope layer directly (without the protocol/session plumbing).

use std::sync::Arc;

use jetstream_model::{
    ApplyOptions, FragmentKind, InMemoryBackend, ModelObject, PropertyDescriptor, PropertyKind,
    Scope, ScopeConfig, SyncFragment, TypeRegistry,
};
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

fn new_scope() -> Scope {
    Scope::new(
        "canvas",
        serde_json::Value::Null,
        canvas_registry(),
        Arc::new(InMemoryBackend::new()),
        ScopeConfig::default(),
    )
}

/// Testable property 1: UUID uniqueness per scope — adding the same UUID
/// twice is rejected by the backend rather than silently overwriting.
#[tokio::test]
async fn uuid_uniqueness_per_scope() {
    let scope = new_scope();
    let uuid = Uuid::new_v4();
    let first = SyncFragment::new(FragmentKind::Add, uuid, "Shape");
    let second = SyncFragment::new(FragmentKind::Add, uuid, "Shape");
    let outcomes = scope
        .apply_sync_fragments(vec![first, second], ApplyOptions::default())
        .await
        .unwrap();
    assert!(outcomes[0].is_ok());
    assert!(!outcomes[1].is_ok());
}

/// Testable property 2: reachability — after every successful apply, every
/// attached object is reachable from the scope root. Detaching a shape from
/// the root's collection prunes it from the backend.
#[tokio::test]
async fn reachability_holds_after_every_apply() {
    let scope = new_scope();
    let root_uuid = Uuid::new_v4();
    let shape_a = Uuid::new_v4();
    let shape_b = Uuid::new_v4();

    let mut root_frag = SyncFragment::new(FragmentKind::Add, root_uuid, "Canvas");
    root_frag.properties.insert("name".into(), json!("demo"));
    let shape_a_frag = SyncFragment::new(FragmentKind::Add, shape_a, "Shape");
    let shape_b_frag = SyncFragment::new(FragmentKind::Add, shape_b, "Shape");
    scope
        .apply_sync_fragments(vec![root_frag, shape_a_frag, shape_b_frag], ApplyOptions::default())
        .await
        .unwrap();
    scope.set_root(root_uuid).await.unwrap();

    let mut link_both = SyncFragment::new(FragmentKind::Change, root_uuid, "Canvas");
    link_both.properties.insert(
        "shapes".into(),
        json!([shape_a.to_string(), shape_b.to_string()]),
    );
    scope.apply_sync_fragments(vec![link_both], ApplyOptions::default()).await.unwrap();
    assert!(scope.get_by_uuid(shape_a).await.unwrap().is_some());
    assert!(scope.get_by_uuid(shape_b).await.unwrap().is_some());

    // Drop shape_b from the collection: it becomes unreachable and must be
    // detached by the next reachability pass.
    let mut link_one = SyncFragment::new(FragmentKind::Change, root_uuid, "Canvas");
    link_one.properties.insert("shapes".into(), json!([shape_a.to_string()]));
    scope.apply_sync_fragments(vec![link_one], ApplyOptions::default()).await.unwrap();
    assert!(scope.get_by_uuid(shape_a).await.unwrap().is_some());
    assert!(scope.get_by_uuid(shape_b).await.unwrap().is_none());
}

/// Testable property 6: round-trip on fragments — `parse(serialize(f)) == f`.
#[test]
fn fragment_round_trips_through_json() {
    let mut frag = SyncFragment::new(FragmentKind::Change, Uuid::new_v4(), "Shape");
    frag.properties.insert("x".into(), json!(3));
    frag.properties.insert("y".into(), json!(4));
    let wire = serde_json::to_string(&frag).unwrap();
    let back: SyncFragment = serde_json::from_str(&wire).unwrap();
    assert_eq!(frag.kind, back.kind);
    assert_eq!(frag.uuid, back.uuid);
    assert_eq!(frag.cls_name, back.cls_name);
    assert_eq!(frag.properties, back.properties);
}

/// `ScopeState`'s fragment list (spec §4.7) is `SyncFragment::from_object`
/// applied to every reachable object — this covers the conversion itself.
#[test]
fn add_fragment_from_object_round_trips_properties() {
    let mut obj = ModelObject::new(Uuid::new_v4(), "Shape".into());
    obj.set("x", jetstream_model::PropertyValue::Scalar(json!(1)));
    obj.set("y", jetstream_model::PropertyValue::Scalar(json!(2)));
    let frag = SyncFragment::from_object(&obj);
    assert_eq!(frag.kind, FragmentKind::Add);
    assert_eq!(frag.uuid, obj.uuid);
    assert_eq!(frag.properties.get("x"), Some(&json!(1)));
    assert_eq!(frag.properties.get("y"), Some(&json!(2)));
}
