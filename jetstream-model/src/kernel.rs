//! Model types, property metadata, and the runtime object graph.
//!
//! A [`TypeRegistry`] holds every declared [`ModelTypeDescriptor`] by name.
//! Declaration happens once, up front; lookups happen continuously on every
//! fragment that arrives afterward, so the registry is a [`DashMap`] rather
//! than a `RwLock<HashMap<..>>` — readers never wait behind each other.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

pub type TypeName = String;
pub type PropertyName = String;
pub type EnumName = String;

/// The kind of value a property holds. `ModelRef` and `Enum` carry the name
/// of the target type/enum rather than a resolved handle, so mutually
/// recursive model types (§9 in the design notes) can be declared in any
/// order and resolved by name once every type exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    String,
    Number,
    Bool,
    Timestamp,
    ModelRef(TypeName),
    Enum(EnumName),
}

/// One property slot on a model type. `collection` is orthogonal to `kind`:
/// a collection of model-refs and a single model-ref share the same kind,
/// differing only in whether they hold one value or an ordered sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: PropertyName,
    pub kind: PropertyKind,
    pub collection: bool,
}

impl PropertyDescriptor {
    pub fn scalar(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self { name: name.into(), kind, collection: false }
    }

    pub fn collection(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self { name: name.into(), kind, collection: true }
    }

    pub fn is_model_ref(&self) -> bool {
        matches!(self.kind, PropertyKind::ModelRef(_))
    }
}

/// Errors raised while declaring model types or enumerations. All are fatal
/// to the construction they occur in — the caller should treat them as a
/// startup-time programming error, not a per-request failure.
#[derive(Debug, thiserror::Error)]
pub enum DeclareError {
    #[error("model type `{0}` already declared")]
    DuplicateType(TypeName),
    #[error("property `{0}` declared twice on the same model type")]
    DuplicateProperty(PropertyName),
    #[error("parent type `{0}` is not declared")]
    UnknownParent(TypeName),
    #[error("enum type `{0}` already declared")]
    DuplicateEnum(EnumName),
    #[error("enum value `{0}` is not an integer")]
    EnumValueNotInteger(String),
    #[error("enum `{enum_name}` has a duplicate value {value} for names `{a}` and `{b}`")]
    DuplicateEnumValue { enum_name: EnumName, value: i64, a: String, b: String },
}

/// A named class: an ordered list of property descriptors plus an optional
/// parent in the inheritance lattice (spec.md §3).
#[derive(Debug, Clone)]
pub struct ModelTypeDescriptor {
    pub name: TypeName,
    pub parent: Option<TypeName>,
    properties: Vec<PropertyDescriptor>,
    property_index: HashMap<PropertyName, usize>,
}

impl ModelTypeDescriptor {
    fn new(name: TypeName, parent: Option<TypeName>) -> Self {
        Self { name, parent, properties: Vec::new(), property_index: HashMap::new() }
    }

    fn declare_property(&mut self, descriptor: PropertyDescriptor) -> Result<(), DeclareError> {
        if self.property_index.contains_key(&descriptor.name) {
            return Err(DeclareError::DuplicateProperty(descriptor.name));
        }
        self.property_index.insert(descriptor.name.clone(), self.properties.len());
        self.properties.push(descriptor);
        Ok(())
    }

    /// The property declared directly on this type — does not walk the
    /// parent chain. Callers that need inherited properties should resolve
    /// through [`TypeRegistry::property`], which does walk it.
    pub fn own_property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.property_index.get(name).map(|&i| &self.properties[i])
    }

    pub fn own_properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.iter()
    }
}

/// Builder handed to a type-declaration callback, mirroring the source's
/// `defineModelType(name, decl => { ... })` shape.
pub struct TypeBuilder<'a> {
    descriptor: &'a mut ModelTypeDescriptor,
    error: Option<DeclareError>,
}

impl<'a> TypeBuilder<'a> {
    /// Declare a scalar or collection property. Declarations after the first
    /// error are ignored; the error surfaces when the registry finishes
    /// building the type.
    pub fn property(&mut self, descriptor: PropertyDescriptor) -> &mut Self {
        if self.error.is_none() {
            if let Err(e) = self.descriptor.declare_property(descriptor) {
                self.error = Some(e);
            }
        }
        self
    }
}

/// Registry of every declared model type and enum, keyed by name.
///
/// Safe to read concurrently from every connection handler; declaration is
/// expected to happen once at startup before the registry is shared.
pub struct TypeRegistry {
    types: DashMap<TypeName, Arc<ModelTypeDescriptor>>,
    enums: DashMap<EnumName, Arc<EnumTypeDescriptor>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self { types: DashMap::new(), enums: DashMap::new() }
    }

    /// Declare a new model type. `parent` must already be declared if given.
    pub fn define_model_type(
        &self,
        name: impl Into<String>,
        parent: Option<&str>,
        build: impl FnOnce(&mut TypeBuilder),
    ) -> Result<(), DeclareError> {
        let name = name.into();
        if self.types.contains_key(&name) {
            return Err(DeclareError::DuplicateType(name));
        }
        let parent = match parent {
            Some(p) => {
                if !self.types.contains_key(p) {
                    return Err(DeclareError::UnknownParent(p.to_string()));
                }
                Some(p.to_string())
            }
            None => None,
        };
        let mut descriptor = ModelTypeDescriptor::new(name.clone(), parent);
        let mut builder = TypeBuilder { descriptor: &mut descriptor, error: None };
        build(&mut builder);
        if let Some(err) = builder.error {
            return Err(err);
        }
        self.types.insert(name, Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelTypeDescriptor>> {
        self.types.get(name).map(|e| e.clone())
    }

    /// Resolve a property by walking up the inheritance chain from `type_name`.
    pub fn property(&self, type_name: &str, property_name: &str) -> Option<PropertyDescriptor> {
        let mut current = self.get(type_name)?;
        loop {
            if let Some(p) = current.own_property(property_name) {
                return Some(p.clone());
            }
            match &current.parent {
                Some(parent) => current = self.get(parent)?,
                None => return None,
            }
        }
    }

    /// Direct children of `type_name` (not transitive).
    pub fn children_of(&self, type_name: &str) -> Vec<TypeName> {
        self.types
            .iter()
            .filter(|e| e.value().parent.as_deref() == Some(type_name))
            .map(|e| e.key().clone())
            .collect()
    }

    /// `type_name` and every descendant, transitively, `type_name` first.
    /// Empty if `type_name` itself was never declared.
    pub fn descendants_of(&self, type_name: &str) -> Vec<TypeName> {
        if self.get(type_name).is_none() {
            return Vec::new();
        }
        let mut out = vec![type_name.to_string()];
        let mut frontier = vec![type_name.to_string()];
        while let Some(next) = frontier.pop() {
            for child in self.children_of(&next) {
                frontier.push(child.clone());
                out.push(child);
            }
        }
        out
    }

    /// Whether `candidate` is `base` or a (possibly transitive) descendant of it.
    pub fn is_subtype(&self, candidate: &str, base: &str) -> bool {
        if candidate == base {
            return true;
        }
        let mut current = self.get(candidate);
        while let Some(desc) = current {
            match &desc.parent {
                Some(p) if p == base => return true,
                Some(p) => current = self.get(p),
                None => return false,
            }
        }
        false
    }

    /// Find the named child type registered under `type_name`, if any direct
    /// or transitive descendant carries that name.
    pub fn find_child(&self, type_name: &str, child_name: &str) -> Option<TypeName> {
        self.descendants_of(type_name).into_iter().find(|t| t == child_name)
    }

    pub fn define_enum(&self, name: impl Into<String>, form: EnumDefForm) -> Result<(), DeclareError> {
        let name = name.into();
        if self.enums.contains_key(&name) {
            return Err(DeclareError::DuplicateEnum(name));
        }
        let descriptor = EnumTypeDescriptor::build(name.clone(), form)?;
        self.enums.insert(name, Arc::new(descriptor));
        Ok(())
    }

    pub fn get_enum(&self, name: &str) -> Option<Arc<EnumTypeDescriptor>> {
        self.enums.get(name).map(|e| e.clone())
    }

    /// Create a fresh, detached instance of `type_name` with no properties set.
    pub fn instantiate(&self, type_name: &str) -> Option<ModelObject> {
        self.get(type_name)?;
        Some(ModelObject::new(Uuid::new_v4(), type_name.to_string()))
    }
}

/// Either input form accepted by [`TypeRegistry::define_enum`] (spec.md §4.1):
/// an explicit `{name: integer}` mapping, or a bare sequence of strings whose
/// ordinal position becomes the value.
pub enum EnumDefForm {
    Mapping(Vec<(String, i64)>),
    Sequence(Vec<String>),
}

#[derive(Debug)]
pub struct EnumTypeDescriptor {
    pub name: EnumName,
    forward: HashMap<String, i64>,
    reverse: HashMap<i64, String>,
}

impl EnumTypeDescriptor {
    fn build(name: EnumName, form: EnumDefForm) -> Result<Self, DeclareError> {
        let pairs: Vec<(String, i64)> = match form {
            EnumDefForm::Mapping(pairs) => pairs,
            EnumDefForm::Sequence(names) => {
                names.into_iter().enumerate().map(|(i, n)| (n, i as i64)).collect()
            }
        };
        let mut forward = HashMap::with_capacity(pairs.len());
        let mut reverse = HashMap::with_capacity(pairs.len());
        for (member, value) in pairs {
            if let Some(existing) = reverse.insert(value, member.clone()) {
                return Err(DeclareError::DuplicateEnumValue {
                    enum_name: name.clone(),
                    value,
                    a: existing,
                    b: member,
                });
            }
            forward.insert(member, value);
        }
        Ok(Self { name, forward, reverse })
    }

    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.forward.get(name).copied()
    }

    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.reverse.get(&value).map(|s| s.as_str())
    }
}

/// Runtime storage for a single property, covering the 2×2 space of
/// scalar/reference crossed with single/collection (spec.md §3, §4.1).
/// Model-reference values are UUIDs, never live object pointers — the
/// object graph is reached through a [`crate::scope::Scope`]'s registry.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Scalar(Value),
    ModelRef(Uuid),
    ScalarList(Vec<Value>),
    ModelRefList(Vec<Uuid>),
}

impl PropertyValue {
    /// UUIDs this value references, for reachability traversal.
    pub fn referenced_uuids(&self) -> Vec<Uuid> {
        match self {
            PropertyValue::ModelRef(u) => vec![*u],
            PropertyValue::ModelRefList(list) => list.clone(),
            _ => Vec::new(),
        }
    }

    /// Back to the wire JSON shape a [`crate::fragment::SyncFragment`]
    /// carries — model-refs serialize as UUID strings, never live pointers
    /// (spec §3's SyncFragment invariant).
    pub fn to_json(&self) -> Value {
        match self {
            PropertyValue::Scalar(v) => v.clone(),
            PropertyValue::ModelRef(u) => Value::String(u.to_string()),
            PropertyValue::ScalarList(vs) => Value::Array(vs.clone()),
            PropertyValue::ModelRefList(us) => {
                Value::Array(us.iter().map(|u| Value::String(u.to_string())).collect())
            }
        }
    }
}

/// Whether an object is attached to a scope or free-standing. Transition to
/// `Attached` happens when an object is set as a scope root or inserted into
/// an already-attached object's property; transition back to `Detached`
/// happens when it is no longer reachable from the root (spec.md §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeBinding {
    Detached,
    Attached(Uuid),
}

/// Runtime instance of a model type.
#[derive(Debug, Clone)]
pub struct ModelObject {
    pub uuid: Uuid,
    pub type_name: TypeName,
    properties: HashMap<PropertyName, PropertyValue>,
    binding: ScopeBinding,
}

impl ModelObject {
    pub fn new(uuid: Uuid, type_name: TypeName) -> Self {
        Self { uuid, type_name, properties: HashMap::new(), binding: ScopeBinding::Detached }
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: PropertyValue) {
        self.properties.insert(name.into(), value);
    }

    pub fn properties(&self) -> &HashMap<PropertyName, PropertyValue> {
        &self.properties
    }

    pub fn binding(&self) -> &ScopeBinding {
        &self.binding
    }

    pub fn attach(&mut self, root: Uuid) {
        self.binding = ScopeBinding::Attached(root);
    }

    pub fn detach(&mut self) {
        self.binding = ScopeBinding::Detached;
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.binding, ScopeBinding::Attached(_))
    }

    /// Every UUID this object's properties reference, for reachability BFS.
    pub fn outgoing_refs(&self) -> Vec<Uuid> {
        self.properties.values().flat_map(|v| v.referenced_uuids()).collect()
    }

    /// The property map in wire JSON form, as an `add` fragment for this
    /// instance would carry it (spec §4.1: "generate the fragment that
    /// would add this instance from nothing"). Building the actual
    /// [`crate::fragment::SyncFragment`] is `SyncFragment::from_object`,
    /// which lives in `fragment.rs` alongside the rest of the fragment
    /// construction code.
    pub fn properties_as_json(&self) -> serde_json::Map<String, Value> {
        self.properties.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_type_is_fatal() {
        let reg = TypeRegistry::new();
        reg.define_model_type("Shape", None, |_| {}).unwrap();
        let err = reg.define_model_type("Shape", None, |_| {}).unwrap_err();
        assert!(matches!(err, DeclareError::DuplicateType(_)));
    }

    #[test]
    fn duplicate_property_is_fatal() {
        let reg = TypeRegistry::new();
        let err = reg
            .define_model_type("Shape", None, |b| {
                b.property(PropertyDescriptor::scalar("x", PropertyKind::Number));
                b.property(PropertyDescriptor::scalar("x", PropertyKind::Number));
            })
            .unwrap_err();
        assert!(matches!(err, DeclareError::DuplicateProperty(_)));
    }

    #[test]
    fn inherited_property_resolves_through_parent() {
        let reg = TypeRegistry::new();
        reg.define_model_type("Shape", None, |b| {
            b.property(PropertyDescriptor::scalar("x", PropertyKind::Number));
        })
        .unwrap();
        reg.define_model_type("Circle", Some("Shape"), |b| {
            b.property(PropertyDescriptor::scalar("radius", PropertyKind::Number));
        })
        .unwrap();
        assert!(reg.property("Circle", "x").is_some());
        assert!(reg.property("Circle", "radius").is_some());
        assert!(reg.property("Shape", "radius").is_none());
    }

    #[test]
    fn find_child_of_an_undeclared_type_is_none() {
        let reg = TypeRegistry::new();
        reg.define_model_type("Shape", None, |_| {}).unwrap();
        assert!(reg.descendants_of("Bogus").is_empty());
        assert!(reg.find_child("Bogus", "Bogus").is_none());
    }

    #[test]
    fn is_subtype_walks_the_lattice() {
        let reg = TypeRegistry::new();
        reg.define_model_type("Shape", None, |_| {}).unwrap();
        reg.define_model_type("Circle", Some("Shape"), |_| {}).unwrap();
        assert!(reg.is_subtype("Circle", "Shape"));
        assert!(reg.is_subtype("Shape", "Shape"));
        assert!(!reg.is_subtype("Shape", "Circle"));
    }

    #[test]
    fn enum_from_sequence_assigns_ordinals() {
        let reg = TypeRegistry::new();
        reg.define_enum(
            "Status",
            EnumDefForm::Sequence(vec!["Open".into(), "Closed".into()]),
        )
        .unwrap();
        let e = reg.get_enum("Status").unwrap();
        assert_eq!(e.value_of("Open"), Some(0));
        assert_eq!(e.value_of("Closed"), Some(1));
        assert_eq!(e.name_of(1), Some("Closed"));
    }

    #[test]
    fn enum_duplicate_value_is_fatal() {
        let reg = TypeRegistry::new();
        let err = reg
            .define_enum(
                "Status",
                EnumDefForm::Mapping(vec![("Open".into(), 0), ("Closed".into(), 0)]),
            )
            .unwrap_err();
        assert!(matches!(err, DeclareError::DuplicateEnumValue { .. }));
    }
}
