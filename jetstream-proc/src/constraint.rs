//! Procedure constraints and batch matching (spec §3, §4.5 step 1).

use std::collections::HashSet;

use jetstream_model::{FragmentKind, ModelObject, SyncFragment};
use serde_json::Value;
use uuid::Uuid;

/// One property condition a constraint places on a matching fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyCondition {
    /// Must carry exactly this value.
    Exact(Value),
    /// Must be present in the fragment's property map at all (any value).
    HasNewValue,
    /// Collection property whose new length is greater than its prior live
    /// length — "something was inserted".
    ArrayInsert,
    /// Collection property whose new length is smaller than its prior live
    /// length — "something was removed".
    ArrayRemove,
}

/// A named property this constraint requires, paired with its condition.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyConstraint {
    pub name: String,
    pub condition: PropertyCondition,
}

/// The shape a single fragment in an incoming batch must have to satisfy one
/// step of a procedure's constraint list (spec §3: "an ordered list of
/// constraints... type, class, required property keys, whether additional
/// properties are allowed, plus optional per-property conditions").
#[derive(Debug, Clone)]
pub struct Constraint {
    pub kind: FragmentKind,
    pub cls_name: String,
    pub properties: Vec<PropertyConstraint>,
    pub allow_additional_properties: bool,
}

impl Constraint {
    pub fn new(kind: FragmentKind, cls_name: impl Into<String>) -> Self {
        Self { kind, cls_name: cls_name.into(), properties: Vec::new(), allow_additional_properties: true }
    }

    pub fn property(mut self, name: impl Into<String>, condition: PropertyCondition) -> Self {
        self.properties.push(PropertyConstraint { name: name.into(), condition });
        self
    }

    pub fn deny_additional_properties(mut self) -> Self {
        self.allow_additional_properties = false;
        self
    }

    /// Whether `frag` satisfies this constraint, given `prior` — the live
    /// object as it stood before the batch containing `frag` was applied
    /// (needed to evaluate `array{insert|remove}` against "the live
    /// object's prior length", spec §4.5 step 1).
    pub fn matches(&self, frag: &SyncFragment, prior: Option<&ModelObject>) -> bool {
        if frag.kind != self.kind || frag.cls_name != self.cls_name {
            return false;
        }
        if !self.properties.is_empty() && !self.allow_additional_properties {
            let required: HashSet<&str> = self.properties.iter().map(|p| p.name.as_str()).collect();
            let present: HashSet<&str> = frag.properties.keys().map(|k| k.as_str()).collect();
            if required != present {
                return false;
            }
        }
        self.properties.iter().all(|p| condition_met(p, frag, prior))
    }
}

fn condition_met(constraint: &PropertyConstraint, frag: &SyncFragment, prior: Option<&ModelObject>) -> bool {
    let value = frag.properties.get(&constraint.name);
    match &constraint.condition {
        PropertyCondition::Exact(expected) => value == Some(expected),
        PropertyCondition::HasNewValue => value.is_some(),
        PropertyCondition::ArrayInsert => array_len_changed(value, prior, &constraint.name, |new, old| new > old),
        PropertyCondition::ArrayRemove => array_len_changed(value, prior, &constraint.name, |new, old| new < old),
    }
}

fn array_len_changed(
    value: Option<&Value>,
    prior: Option<&ModelObject>,
    property: &str,
    cmp: impl Fn(usize, usize) -> bool,
) -> bool {
    let Some(new_len) = value.and_then(Value::as_array).map(Vec::len) else {
        return false;
    };
    let prior_len = prior
        .and_then(|o| o.get(property))
        .map(|pv| pv.to_json())
        .and_then(|v| v.as_array().map(Vec::len))
        .unwrap_or(0);
    cmp(new_len, prior_len)
}

/// Match every constraint against the batch, first-fit, removing each
/// matched fragment as it goes (spec §4.5 step 1, verbatim: "iterates
/// constraints and removes each matched fragment; the batch matches iff no
/// unmatched fragments remain"). The original design does not specify
/// tie-breaking among multiple same-shaped fragments; first-fit is the
/// simplest faithful reading (SPEC_FULL §5).
pub fn match_batch(
    constraints: &[Constraint],
    fragments: &[SyncFragment],
    prior: &std::collections::HashMap<Uuid, ModelObject>,
) -> bool {
    let mut remaining: Vec<&SyncFragment> = fragments.iter().collect();
    for constraint in constraints {
        let pos = remaining.iter().position(|f| constraint.matches(f, prior.get(&f.uuid)));
        match pos {
            Some(i) => {
                remaining.remove(i);
            }
            None => return false,
        }
    }
    remaining.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jetstream_model::FragmentKind as FK;
    use serde_json::json;

    fn frag_with(kind: FK, cls: &str, props: &[(&str, Value)]) -> SyncFragment {
        let mut f = SyncFragment::new(kind, Uuid::new_v4(), cls);
        for (k, v) in props {
            f.properties.insert((*k).to_string(), v.clone());
        }
        f
    }

    #[test]
    fn matches_by_kind_and_class() {
        let c = Constraint::new(FK::Add, "Message");
        let f = frag_with(FK::Add, "Message", &[]);
        assert!(c.matches(&f, None));
        let wrong = frag_with(FK::Change, "Message", &[]);
        assert!(!c.matches(&wrong, None));
    }

    #[test]
    fn required_property_sets_must_match_exactly() {
        let c = Constraint::new(FK::Add, "Message")
            .property("text", PropertyCondition::HasNewValue)
            .deny_additional_properties();
        let ok = frag_with(FK::Add, "Message", &[("text", json!("hi"))]);
        assert!(c.matches(&ok, None));
        let missing = frag_with(FK::Add, "Message", &[]);
        assert!(!c.matches(&missing, None));
        let extra = frag_with(FK::Add, "Message", &[("text", json!("hi")), ("extra", json!(1))]);
        assert!(!c.matches(&extra, None));
    }

    #[test]
    fn array_insert_condition_needs_growth_over_prior() {
        let c = Constraint::new(FK::Change, "ChatRoom").property("messages", PropertyCondition::ArrayInsert);
        let mut prior = ModelObject::new(Uuid::new_v4(), "ChatRoom".into());
        prior.set("messages", jetstream_model::PropertyValue::ScalarList(vec![json!("a")]));
        let grown = frag_with(FK::Change, "ChatRoom", &[("messages", json!(["a", "b"]))]);
        assert!(c.matches(&grown, Some(&prior)));
        let same = frag_with(FK::Change, "ChatRoom", &[("messages", json!(["a"]))]);
        assert!(!c.matches(&same, Some(&prior)));
    }

    #[test]
    fn match_batch_requires_every_constraint_and_no_leftovers() {
        let constraints = vec![Constraint::new(FK::Add, "Message")];
        let fragments = vec![frag_with(FK::Add, "Message", &[]), frag_with(FK::Add, "Extra", &[])];
        assert!(!match_batch(&constraints, &fragments, &std::collections::HashMap::new()));
        let fragments = vec![frag_with(FK::Add, "Message", &[])];
        assert!(match_batch(&constraints, &fragments, &std::collections::HashMap::new()));
    }
}
