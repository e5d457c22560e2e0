//! MongoDB-style update documents (`$set`/`$push`/`$pull`/`$addToSet`)
//! translated into sync-fragment batches (spec §4.4).

use std::collections::HashMap;

use jetstream_model::{
    ApplyOptions, FragmentKind, FragmentOutcome, ModelObject, PropertyDescriptor, PropertyKind,
    PropertyValue, Scope, ScopeCursor, SyncFragment, TypeRegistry,
};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::QueryError;
use crate::keypath::{resolve_index, KeyPath, Segment};

/// Which of the four MongoDB-style operators an update document carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Set,
    Push,
    Pull,
    AddToSet,
}

impl Operator {
    fn wire_key(self) -> &'static str {
        match self {
            Operator::Set => "$set",
            Operator::Push => "$push",
            Operator::Pull => "$pull",
            Operator::AddToSet => "$addToSet",
        }
    }

    const ALL: [Operator; 4] = [Operator::Set, Operator::Push, Operator::Pull, Operator::AddToSet];
}

/// One `<keypath>: <value>` entry from the update document, still carrying
/// its raw JSON value — literal expansion and the operator-specific final
/// value are computed at [`execute`] time, once the live owner object is
/// known (spec §4.4's two-phase shape).
#[derive(Debug, Clone)]
struct PreparedModification {
    keypath: KeyPath,
    raw_value: Value,
}

/// Output of `prepare_and_validate`: a validated, not-yet-executed update.
#[derive(Debug, Clone)]
pub struct PreparedUpdate {
    operator: Operator,
    modifications: Vec<PreparedModification>,
}

/// Resolve a property by walking the inheritance chain of `cls`, falling
/// back to a search across every descendant when `cls` itself doesn't
/// declare it (spec §4.4: "ambiguous property references across sibling
/// descendants are a fatal error"). When `cls` is concrete (the common
/// case once a live object is in hand) this is just `registry.property`.
fn resolve_property(
    registry: &TypeRegistry,
    cls: &str,
    name: &str,
) -> Result<PropertyDescriptor, QueryError> {
    if let Some(p) = registry.property(cls, name) {
        return Ok(p);
    }
    let mut found: Option<PropertyDescriptor> = None;
    for descendant in registry.descendants_of(cls) {
        let Some(type_descriptor) = registry.get(&descendant) else { continue };
        if let Some(p) = type_descriptor.own_property(name) {
            match &found {
                None => found = Some(p.clone()),
                Some(existing) if existing == p => {}
                Some(_) => return Err(QueryError::AmbiguousProperty(name.to_string())),
            }
        }
    }
    found.ok_or_else(|| QueryError::UnknownProperty(name.to_string(), cls.to_string()))
}

/// Validate an update document's shape and keypaths against the static
/// type tree (spec §4.4's `prepareAndValidate`). `target_cls` is the
/// declared class of the object the query will eventually target — it may
/// be a supertype, in which case single-segment keypaths are resolved
/// across its descendants; deeper keypaths are re-validated at `execute`
/// time against the concrete runtime type found while walking the graph,
/// since a supertype's property shape can't be known for an object that
/// doesn't exist yet.
pub fn prepare_and_validate(
    registry: &TypeRegistry,
    target_cls: &str,
    update_doc: &Value,
) -> Result<PreparedUpdate, QueryError> {
    let doc = update_doc.as_object().ok_or(QueryError::MalformedUpdateDocument)?;
    let present: Vec<Operator> =
        Operator::ALL.into_iter().filter(|op| doc.contains_key(op.wire_key())).collect();
    let operator = match present.as_slice() {
        [op] => *op,
        _ => return Err(QueryError::NotExactlyOneOperator),
    };
    let mods_doc = doc
        .get(operator.wire_key())
        .and_then(Value::as_object)
        .ok_or(QueryError::MalformedUpdateDocument)?;

    let mut modifications = Vec::with_capacity(mods_doc.len());
    for (raw_keypath, raw_value) in mods_doc {
        let keypath = KeyPath::parse(raw_keypath)?;
        if keypath.segments().len() == 1 {
            // Single-segment keypath: the property lives directly on the
            // target object, so its shape is checkable right now.
            resolve_property(registry, target_cls, keypath.final_property())?;
        }
        modifications.push(PreparedModification { keypath, raw_value: raw_value.clone() });
    }
    Ok(PreparedUpdate { operator, modifications })
}

/// Aggregated result of a query execution (spec §4.4's `QueryResult`).
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub matched: Vec<Uuid>,
    pub created: Vec<Uuid>,
    pub modified: Vec<Uuid>,
    pub errors: Vec<(Uuid, String)>,
    /// Supplemented (SPEC_FULL §4): set when the idempotence edge case
    /// (spec §8 testable property 7 — `$set` with the current value) fires
    /// for every modification, so the caller can skip a redundant
    /// broadcast without re-inspecting the fragment list.
    pub no_op: bool,
}

/// Run a prepared update against `target_uuid` (spec §4.4's `execute`).
/// Acquires the scope's write lock before walking any keypath and holds it
/// through the final `apply_sync_fragments` call (SPEC_FULL §11, resolving
/// the `PushQueryOperation` write-lock question in favor of the
/// write-locked form).
pub async fn execute(
    scope: &Scope,
    target_uuid: Uuid,
    target_cls: &str,
    prepared: PreparedUpdate,
    options: ApplyOptions,
) -> Result<QueryResult, QueryError> {
    scope
        .with_write_lock(|mut cursor| async move {
            execute_locked(&mut cursor, target_uuid, target_cls, prepared, options).await
        })
        .await
}

async fn execute_locked(
    cursor: &mut ScopeCursor<'_>,
    target_uuid: Uuid,
    target_cls: &str,
    prepared: PreparedUpdate,
    options: ApplyOptions,
) -> Result<QueryResult, QueryError> {
    if cursor.get_by_uuid(target_uuid).await?.is_none() {
        return Err(jetstream_model::ScopeError::TargetMissing(target_uuid).into());
    }

    let mut synthesized_adds: Vec<SyncFragment> = Vec::new();
    let mut created = Vec::new();
    let mut per_owner: HashMap<Uuid, (String, Map<String, Value>)> = HashMap::new();
    let mut no_op = true;

    for modification in prepared.modifications {
        let (owner_uuid, owner_cls, owner_obj) =
            resolve_owner(cursor, target_uuid, target_cls, &modification.keypath).await?;
        let prop_name = modification.keypath.final_property();
        let descriptor = resolve_property(cursor.scope().registry(), &owner_cls, prop_name)?;

        let items = normalize_items(&descriptor, prepared.operator, modification.raw_value)?;
        let items = expand_items(
            cursor.scope().registry(),
            &descriptor.kind,
            items,
            &mut synthesized_adds,
            &mut created,
        )?;

        let current = owner_obj.get(prop_name).cloned();
        let final_value =
            compute_final_value(cursor, prepared.operator, &descriptor, current.as_ref(), &items)
                .await?;
        if let Some(value) = final_value {
            no_op = false;
            let entry =
                per_owner.entry(owner_uuid).or_insert_with(|| (owner_cls.clone(), Map::new()));
            entry.1.insert(prop_name.to_string(), value);
        }
    }

    let mut fragments = synthesized_adds;
    let mut modified = Vec::new();
    for (owner_uuid, (owner_cls, properties)) in per_owner {
        modified.push(owner_uuid);
        let mut frag = SyncFragment::new(FragmentKind::Change, owner_uuid, owner_cls);
        frag.properties = properties;
        fragments.push(frag);
    }

    let matched = vec![target_uuid];
    if fragments.is_empty() {
        return Ok(QueryResult { matched, created, modified, errors: Vec::new(), no_op: true });
    }

    let outcomes = cursor.apply(fragments.clone(), options).await?;
    let mut errors = Vec::new();
    for (frag, outcome) in fragments.iter().zip(outcomes.iter()) {
        if let FragmentOutcome::Error(message) = outcome {
            errors.push((frag.uuid, message.clone()));
        }
    }
    Ok(QueryResult { matched, created, modified, errors, no_op })
}

/// Walk every segment but the last (the final property) from `start_uuid`,
/// following model-ref properties and indexing into collections, and
/// return the live object the final property actually lives on.
async fn resolve_owner(
    cursor: &ScopeCursor<'_>,
    start_uuid: Uuid,
    start_cls: &str,
    keypath: &KeyPath,
) -> Result<(Uuid, String, ModelObject), QueryError> {
    let segments = keypath.segments();
    let mut current_uuid = start_uuid;
    let mut current_cls = start_cls.to_string();
    let mut current_obj = cursor
        .get_by_uuid(current_uuid)
        .await?
        .ok_or(jetstream_model::ScopeError::TargetMissing(current_uuid))?;

    let mut i = 0;
    while i < segments.len() - 1 {
        let Segment::Key(name) = &segments[i] else {
            return Err(QueryError::MalformedKeyPath(format!("{segments:?}")));
        };
        let descriptor = resolve_property(cursor.scope().registry(), &current_cls, name)?;
        if !matches!(descriptor.kind, PropertyKind::ModelRef(_)) {
            return Err(QueryError::NotAModelRef(name.clone()));
        }
        let next_uuid = if descriptor.collection {
            i += 1;
            let idx = match segments.get(i) {
                Some(Segment::Index(n)) => *n,
                _ => return Err(QueryError::IndexOnScalar(name.clone())),
            };
            let list = match current_obj.get(name) {
                Some(PropertyValue::ModelRefList(list)) => list.clone(),
                _ => Vec::new(),
            };
            let pos = resolve_index(list.len(), idx)?;
            list[pos]
        } else {
            match current_obj.get(name) {
                Some(PropertyValue::ModelRef(u)) => *u,
                _ => return Err(QueryError::NotAModelRef(name.clone())),
            }
        };
        current_obj = cursor
            .get_by_uuid(next_uuid)
            .await?
            .ok_or(jetstream_model::ScopeError::TargetMissing(next_uuid))?;
        current_cls = current_obj.type_name.clone();
        current_uuid = next_uuid;
        i += 1;
    }
    Ok((current_uuid, current_cls, current_obj))
}

/// Fold the update-document value for one keypath into the `[v0..vm]`
/// modification list spec §4.4's operator table describes. A single JSON
/// value (the common case — `$push: {shapes: {...}}`) becomes a one-item
/// list; an explicit array is taken as-is.
fn normalize_items(
    descriptor: &PropertyDescriptor,
    operator: Operator,
    raw_value: Value,
) -> Result<Vec<Value>, QueryError> {
    match operator {
        Operator::Set => {
            if descriptor.collection {
                raw_value.as_array().cloned().ok_or(QueryError::SetOfCollectionNotAnArray)
            } else {
                Ok(vec![raw_value])
            }
        }
        Operator::Push | Operator::Pull | Operator::AddToSet => {
            if !descriptor.collection {
                return Err(QueryError::OperatorRequiresCollection(descriptor.name.clone()));
            }
            match raw_value {
                Value::Array(items) => Ok(items),
                other => Ok(vec![other]),
            }
        }
    }
}

/// Expand any inline object literal among `items` into a synthetic `add`
/// fragment with a freshly allocated UUID (spec §4.4: "translate inline
/// literal objects into synthetic `add` fragments with freshly allocated
/// UUIDs"), recursively, so a literal's own model-ref properties can
/// themselves carry literals.
fn expand_items(
    registry: &TypeRegistry,
    kind: &PropertyKind,
    items: Vec<Value>,
    synthesized: &mut Vec<SyncFragment>,
    created: &mut Vec<Uuid>,
) -> Result<Vec<Value>, QueryError> {
    let PropertyKind::ModelRef(target_type) = kind else {
        return Ok(items);
    };
    items
        .into_iter()
        .map(|item| expand_literal(registry, target_type, item, synthesized, created))
        .collect()
}

fn expand_literal(
    registry: &TypeRegistry,
    target_type: &str,
    value: Value,
    synthesized: &mut Vec<SyncFragment>,
    created: &mut Vec<Uuid>,
) -> Result<Value, QueryError> {
    let Value::Object(mut obj) = value else {
        // Already a UUID-string reference to an existing object.
        return Ok(value);
    };
    let cls = obj
        .remove("$cls")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| target_type.to_string());
    let uuid = obj
        .remove("$uuid")
        .and_then(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()))
        .unwrap_or_else(Uuid::new_v4);

    let mut frag = SyncFragment::new(FragmentKind::Add, uuid, cls.clone());
    for (key, val) in obj {
        let descriptor = resolve_property(registry, &cls, &key)?;
        let resolved = if let PropertyKind::ModelRef(inner_target) = &descriptor.kind {
            if descriptor.collection {
                let inner_items = val.as_array().cloned().unwrap_or_default();
                let expanded: Vec<Value> = inner_items
                    .into_iter()
                    .map(|it| expand_literal(registry, inner_target, it, synthesized, created))
                    .collect::<Result<_, _>>()?;
                Value::Array(expanded)
            } else {
                expand_literal(registry, inner_target, val, synthesized, created)?
            }
        } else {
            val
        };
        frag.properties.insert(key, resolved);
    }
    created.push(uuid);
    synthesized.push(frag);
    Ok(Value::String(uuid.to_string()))
}

/// Apply the operator-specific final-value rule (spec §4.4's table) to a
/// property's current value and the modification list. Returns `None` when
/// the result equals the current value — the `$set`-is-a-no-op edge case
/// (spec §8 testable property 7) falls naturally out of this, rather than
/// needing special-casing for just `$set`.
async fn compute_final_value(
    cursor: &ScopeCursor<'_>,
    operator: Operator,
    descriptor: &PropertyDescriptor,
    current: Option<&PropertyValue>,
    items: &[Value],
) -> Result<Option<Value>, QueryError> {
    if descriptor.collection {
        let current_list: Vec<Value> = match current.map(|pv| pv.to_json()) {
            Some(Value::Array(a)) => a,
            _ => Vec::new(),
        };
        let result_list = match operator {
            Operator::Push => {
                let mut out = current_list.clone();
                out.extend(items.iter().cloned());
                out
            }
            Operator::AddToSet => {
                let mut out = current_list.clone();
                for item in items {
                    if !out.contains(item) {
                        out.push(item.clone());
                    }
                }
                out
            }
            Operator::Pull => {
                let mut out = Vec::with_capacity(current_list.len());
                for elem in &current_list {
                    let mut matched_any = false;
                    for filter in items {
                        if matches_pull_filter(cursor, &descriptor.kind, elem, filter).await? {
                            matched_any = true;
                            break;
                        }
                    }
                    if !matched_any {
                        out.push(elem.clone());
                    }
                }
                out
            }
            Operator::Set => items.to_vec(),
        };
        if result_list == current_list {
            Ok(None)
        } else {
            Ok(Some(Value::Array(result_list)))
        }
    } else {
        let new_value = items.first().cloned().unwrap_or(Value::Null);
        let current_value = current.map(|pv| pv.to_json()).unwrap_or(Value::Null);
        if new_value == current_value {
            Ok(None)
        } else {
            Ok(Some(new_value))
        }
    }
}

/// `$pull` filter match: an exact scalar filter matches by value equality;
/// an object predicate filters a model-ref collection by the referenced
/// object's live properties, with `$uuid` normalized to `uuid` (spec
/// §4.4).
async fn matches_pull_filter(
    cursor: &ScopeCursor<'_>,
    kind: &PropertyKind,
    elem: &Value,
    filter: &Value,
) -> Result<bool, QueryError> {
    let Value::Object(predicate) = filter else {
        return Ok(elem == filter);
    };
    let PropertyKind::ModelRef(_) = kind else {
        return Ok(elem == filter);
    };
    let Some(uuid) = elem.as_str().and_then(|s| Uuid::parse_str(s).ok()) else {
        return Ok(false);
    };
    for (raw_key, expected) in predicate {
        let key = if raw_key == "$uuid" { "uuid" } else { raw_key.as_str() };
        if key == "uuid" {
            if expected.as_str() != Some(uuid.to_string().as_str()) {
                return Ok(false);
            }
            continue;
        }
        let Some(obj) = cursor.get_by_uuid(uuid).await? else {
            return Ok(false);
        };
        let actual = obj.get(key).map(|pv| pv.to_json());
        if actual.as_ref() != Some(expected) {
            return Ok(false);
        }
    }
    Ok(true)
}
