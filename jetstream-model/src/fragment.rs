//! Sync fragments: the wire-level description of a single change to the
//! object graph (spec §3, §4.2).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::FragmentError;
use crate::kernel::{ModelObject, PropertyKind, TypeRegistry};

/// What a fragment does to the object it targets. Serializes to the exact
/// lowercase wire tokens used by scenario traces in spec §8
/// (`"add"`, `"change"`, `"remove"`, `"movechange"`, `"root"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentKind {
    Add,
    Change,
    Remove,
    Movechange,
    Root,
}

/// A single applied-or-applicable change record. Every fragment that has
/// left a [`crate::fragment::LateBoundFragment`] builder carries a concrete
/// `uuid` and `cls_name` — that's the invariant the builder enforces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFragment {
    #[serde(rename = "type")]
    pub kind: FragmentKind,
    pub uuid: Uuid,
    #[serde(rename = "clsName")]
    pub cls_name: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl SyncFragment {
    pub fn new(kind: FragmentKind, uuid: Uuid, cls_name: impl Into<String>) -> Self {
        Self { kind, uuid, cls_name: cls_name.into(), properties: Map::new() }
    }

    /// The `add` fragment that would recreate `obj` from nothing (spec
    /// §4.1), used by the scope-fetch flow to describe an already-attached
    /// object to a newly connecting client (spec §4.7's `ScopeState`).
    pub fn from_object(obj: &ModelObject) -> Self {
        Self {
            kind: FragmentKind::Add,
            uuid: obj.uuid,
            cls_name: obj.type_name.clone(),
            properties: obj.properties_as_json(),
        }
    }

    /// Validate this fragment's properties against the declared shape of
    /// `cls_name` (or one of its descendants, for `add`). Checks: every
    /// property name is declared, collection-ness matches, and scalar
    /// values are roughly the right JSON shape for their kind. Does not
    /// check model-ref targets exist — that's a scope-level concern since
    /// it requires the rest of the batch.
    pub fn validate(&self, registry: &TypeRegistry) -> Result<(), FragmentError> {
        let resolved_type = if self.kind == FragmentKind::Add {
            registry
                .find_child(&self.cls_name, &self.cls_name)
                .or_else(|| registry.get(&self.cls_name).map(|_| self.cls_name.clone()))
                .ok_or_else(|| FragmentError::UnknownType(self.cls_name.clone()))?
        } else {
            registry
                .get(&self.cls_name)
                .map(|_| self.cls_name.clone())
                .ok_or_else(|| FragmentError::UnknownType(self.cls_name.clone()))?
        };

        for (name, value) in &self.properties {
            let descriptor = registry.property(&resolved_type, name).ok_or_else(|| {
                FragmentError::UnknownProperty(name.clone(), resolved_type.clone())
            })?;

            let is_array = value.is_array();
            if descriptor.collection && !is_array {
                return Err(FragmentError::ExpectedCollection { property: name.clone() });
            }
            if !descriptor.collection && is_array {
                return Err(FragmentError::UnexpectedCollection { property: name.clone() });
            }

            let values: Vec<&Value> = if descriptor.collection {
                value.as_array().unwrap().iter().collect()
            } else {
                vec![value]
            };
            for v in values {
                check_kind(v, &descriptor.kind, name)?;
            }
        }
        Ok(())
    }
}

fn check_kind(value: &Value, kind: &PropertyKind, property: &str) -> Result<(), FragmentError> {
    let ok = match kind {
        PropertyKind::String => value.is_string(),
        PropertyKind::Number => value.is_number(),
        PropertyKind::Bool => value.is_boolean(),
        PropertyKind::Timestamp => value.is_string() || value.is_number(),
        PropertyKind::Enum(_) => value.is_string() || value.is_number(),
        // A model-ref property accepts a UUID string (reference to an
        // existing or sibling-fragment object) or an inline object literal
        // describing a nested `add`. Either way the wire shape is loose
        // here; the scope apply pipeline resolves the actual target.
        PropertyKind::ModelRef(_) => value.is_string() || value.is_object(),
    };
    if ok {
        Ok(())
    } else {
        Err(FragmentError::TypeMismatch {
            property: property.to_string(),
            expected_kind: format!("{kind:?}"),
        })
    }
}

/// Type-state builder for assembling a [`SyncFragment`] from pieces that
/// may arrive independently — e.g. a procedure computing properties before
/// it knows which concrete object they belong to. Mirrors the scatter/
/// gather construction spec §4.2 describes for late-bound fragments.
#[derive(Debug, Default, Clone)]
pub struct LateBoundFragment {
    kind: Option<FragmentKind>,
    uuid: Option<Uuid>,
    cls_name: Option<String>,
    properties: HashMap<String, Value>,
}

impl LateBoundFragment {
    pub fn new(kind: FragmentKind) -> Self {
        Self { kind: Some(kind), uuid: None, cls_name: None, properties: HashMap::new() }
    }

    pub fn bind_object_uuid(&mut self, uuid: Uuid) -> &mut Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn bind_cls_name(&mut self, cls_name: impl Into<String>) -> &mut Self {
        self.cls_name = Some(cls_name.into());
        self
    }

    /// Set a property, or panic-free error if the fragment's target type is
    /// already known and doesn't declare it. When the type isn't bound yet
    /// the value is accepted unchecked and re-validated once `cls_name` is set.
    pub fn set_properties_or_throw(
        &mut self,
        registry: &TypeRegistry,
        name: impl Into<String>,
        value: Value,
    ) -> Result<&mut Self, FragmentError> {
        let name = name.into();
        if let Some(cls_name) = &self.cls_name {
            registry
                .property(cls_name, &name)
                .ok_or_else(|| FragmentError::UnknownProperty(name.clone(), cls_name.clone()))?;
        }
        self.properties.insert(name, value);
        Ok(self)
    }

    pub fn into_fragment(self) -> Result<SyncFragment, FragmentError> {
        let uuid = self.uuid.ok_or(FragmentError::MissingUuid)?;
        let cls_name = self.cls_name.ok_or(FragmentError::MissingClsName)?;
        let kind = self.kind.unwrap_or(FragmentKind::Change);
        let mut properties = Map::new();
        for (k, v) in self.properties {
            properties.insert(k, v);
        }
        Ok(SyncFragment { kind, uuid, cls_name, properties })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{PropertyDescriptor, PropertyKind};
    use serde_json::json;

    fn registry_with_shape() -> TypeRegistry {
        let reg = TypeRegistry::new();
        reg.define_model_type("Shape", None, |b| {
            b.property(PropertyDescriptor::scalar("name", PropertyKind::String));
            b.property(PropertyDescriptor::collection("tags", PropertyKind::String));
        })
        .unwrap();
        reg
    }

    #[test]
    fn fragment_kind_serializes_lowercase() {
        let s = serde_json::to_string(&FragmentKind::Movechange).unwrap();
        assert_eq!(s, "\"movechange\"");
    }

    #[test]
    fn validate_accepts_matching_shape() {
        let reg = registry_with_shape();
        let mut frag = SyncFragment::new(FragmentKind::Change, Uuid::new_v4(), "Shape");
        frag.properties.insert("name".into(), json!("square"));
        frag.properties.insert("tags".into(), json!(["red", "big"]));
        frag.validate(&reg).unwrap();
    }

    #[test]
    fn validate_rejects_add_of_an_unregistered_class() {
        let reg = registry_with_shape();
        let frag = SyncFragment::new(FragmentKind::Add, Uuid::new_v4(), "Bogus");
        assert!(matches!(frag.validate(&reg), Err(FragmentError::UnknownType(_))));
    }

    #[test]
    fn validate_rejects_unknown_property() {
        let reg = registry_with_shape();
        let mut frag = SyncFragment::new(FragmentKind::Change, Uuid::new_v4(), "Shape");
        frag.properties.insert("nope".into(), json!(1));
        assert!(matches!(frag.validate(&reg), Err(FragmentError::UnknownProperty(_, _))));
    }

    #[test]
    fn validate_rejects_collection_mismatch() {
        let reg = registry_with_shape();
        let mut frag = SyncFragment::new(FragmentKind::Change, Uuid::new_v4(), "Shape");
        frag.properties.insert("name".into(), json!(["not", "scalar"]));
        assert!(matches!(
            frag.validate(&reg),
            Err(FragmentError::UnexpectedCollection { .. })
        ));
    }

    #[test]
    fn late_bound_fragment_requires_uuid_and_cls_name() {
        let mut builder = LateBoundFragment::new(FragmentKind::Add);
        assert!(matches!(builder.clone().into_fragment(), Err(FragmentError::MissingUuid)));
        builder.bind_object_uuid(Uuid::new_v4());
        assert!(matches!(builder.clone().into_fragment(), Err(FragmentError::MissingClsName)));
        builder.bind_cls_name("Shape");
        assert!(builder.into_fragment().is_ok());
    }

    #[test]
    fn late_bound_fragment_validates_property_once_bound() {
        let reg = registry_with_shape();
        let mut builder = LateBoundFragment::new(FragmentKind::Change);
        builder.bind_cls_name("Shape");
        let err = builder.set_properties_or_throw(&reg, "nope", json!(1)).unwrap_err();
        assert!(matches!(err, FragmentError::UnknownProperty(_, _)));
    }
}
