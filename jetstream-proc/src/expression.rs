//! The expression DSL (spec §3, §4.5): `$incoming`, `$rootModel`, `$scope`,
//! `$model.find(...)`, `$case.<tag>(...)`. Parsed once at procedure
//! registration time into an [`Expr`] tree; evaluation against a
//! [`ExprContext`] is then a pure(ish) walk with no further string parsing,
//! so a malformed expression is a registration-time error, not a first-use
//! surprise.

use std::collections::HashMap;

use jetstream_model::{FragmentKind, ModelObject, Scope, SyncFragment};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ExpressionError, ProcError};

/// Fragments of an incoming batch indexed by `<Class>.<type>`, per spec §3's
/// context tuple `(scope, incoming fragments indexed by "<Class>.<type>",
/// options)`. Keyed by a tuple rather than a formatted string so lookups
/// avoid string-split parsing on the hot path (SPEC_FULL §5).
pub type FragmentsByKey<'a> = HashMap<(String, FragmentKind), Vec<&'a SyncFragment>>;

/// Build a [`FragmentsByKey`] index fresh for one incoming batch.
pub fn index_fragments(fragments: &[SyncFragment]) -> FragmentsByKey<'_> {
    let mut map: FragmentsByKey<'_> = HashMap::new();
    for frag in fragments {
        map.entry((frag.cls_name.clone(), frag.kind)).or_default().push(frag);
    }
    map
}

/// `$case.<tag>(...)` substitution tables, supplied by the embedder per
/// procedure invocation (spec §4.5: "map result through `options.cases[tag]`").
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cases: HashMap<String, HashMap<String, Value>>,
}

/// Snapshot of live object state captured *before* a batch is applied, used
/// to compute `inserted`/`removed` dynamic indices (spec §4.5: "diff the
/// incoming collection against the live one").
pub type PriorSnapshot = HashMap<Uuid, ModelObject>;

/// The `(scope, incoming fragments, options)` tuple expressions evaluate
/// against (spec §3), plus the prior-state snapshot the `inserted`/`removed`
/// suffixes need.
pub struct ExprContext<'a> {
    pub scope: &'a Scope,
    pub incoming: &'a FragmentsByKey<'a>,
    pub options: &'a ExecOptions,
    pub prior: &'a PriorSnapshot,
}

/// Index suffix on an `$incoming` field reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingIndex {
    Literal(i64),
    Inserted(i64),
    Removed(i64),
}

/// Parsed form of one expression string (spec §3, §4.5).
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Incoming {
        class: String,
        kind: FragmentKind,
        field: String,
        index: Option<IncomingIndex>,
    },
    RootModel {
        keypath: Vec<String>,
        property: String,
    },
    ScopeName,
    ScopeParams {
        keypath: Vec<String>,
    },
    ModelFind {
        inner: Box<Expr>,
        keypath: Vec<String>,
        property: String,
    },
    Case {
        tag: String,
        inner: Box<Expr>,
    },
}

impl Expr {
    pub fn parse(raw: &str) -> Result<Self, ExpressionError> {
        if let Some(rest) = raw.strip_prefix("$incoming.") {
            return parse_incoming(rest);
        }
        if let Some(rest) = raw.strip_prefix("$rootModel.") {
            return Ok(parse_keypath_and_property(rest, |keypath, property| Expr::RootModel {
                keypath,
                property,
            }));
        }
        if raw == "$scope.name" {
            return Ok(Expr::ScopeName);
        }
        if let Some(rest) = raw.strip_prefix("$scope.params.") {
            return Ok(Expr::ScopeParams { keypath: rest.split('.').map(String::from).collect() });
        }
        if let Some(rest) = raw.strip_prefix("$model.find(") {
            let close = find_matching_close(rest, raw)?;
            let inner_str = &rest[..close];
            let after = rest[close + 1..]
                .strip_prefix('.')
                .ok_or_else(|| ExpressionError::Malformed(raw.to_string()))?;
            let inner = Box::new(Expr::parse(inner_str)?);
            return Ok(parse_keypath_and_property(after, move |keypath, property| Expr::ModelFind {
                inner,
                keypath,
                property,
            }));
        }
        if let Some(rest) = raw.strip_prefix("$case.") {
            let paren = rest.find('(').ok_or_else(|| ExpressionError::Malformed(raw.to_string()))?;
            let tag = rest[..paren].to_string();
            let after_open = &rest[paren + 1..];
            let close = find_matching_close(after_open, raw)?;
            let inner = Box::new(Expr::parse(&after_open[..close])?);
            return Ok(Expr::Case { tag, inner });
        }
        Err(ExpressionError::Malformed(raw.to_string()))
    }

    pub async fn eval(&self, ctx: &ExprContext<'_>) -> Result<Value, ProcError> {
        match self {
            Expr::Incoming { class, kind, field, index } => eval_incoming(ctx, class, *kind, field, index),
            Expr::RootModel { keypath, property } => {
                let root = ctx.scope.get_root().await.ok_or_else(|| fail(self, "no scope root set"))?;
                eval_keypath_from(ctx, root, keypath, property).await
            }
            Expr::ScopeName => Ok(Value::String(ctx.scope.name.clone())),
            Expr::ScopeParams { keypath } => {
                let mut cur = &ctx.scope.params;
                for seg in keypath {
                    cur = cur.get(seg).ok_or_else(|| fail(self, "scope params keypath not found"))?;
                }
                Ok(cur.clone())
            }
            Expr::ModelFind { inner, keypath, property } => {
                let found = Box::pin(inner.eval(ctx)).await?;
                let uuid = found
                    .as_str()
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| fail(self, "$model.find inner expression did not evaluate to a uuid"))?;
                eval_keypath_from(ctx, uuid, keypath, property).await
            }
            Expr::Case { tag, inner } => {
                let val = Box::pin(inner.eval(ctx)).await?;
                let key = case_key(&val);
                let mapping = ctx
                    .options
                    .cases
                    .get(tag)
                    .ok_or_else(|| fail(self, &format!("no $case mapping registered for tag `{tag}`")))?;
                mapping
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| fail(self, &format!("$case mapping `{tag}` has no entry for `{key}`")))
            }
        }
    }
}

fn fail(expr: &Expr, reason: &str) -> ProcError {
    ProcError::EvalFailed { expr: format!("{expr:?}"), reason: reason.to_string() }
}

fn case_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn eval_keypath_from(
    ctx: &ExprContext<'_>,
    start: Uuid,
    keypath: &[String],
    property: &str,
) -> Result<Value, ProcError> {
    let mut uuid = start;
    for seg in keypath {
        let obj = ctx
            .scope
            .get_by_uuid(uuid)
            .await?
            .ok_or(ProcError::Scope(jetstream_model::ScopeError::TargetMissing(uuid)))?;
        match obj.get(seg) {
            Some(jetstream_model::PropertyValue::ModelRef(next)) => uuid = *next,
            _ => {
                return Err(ProcError::EvalFailed {
                    expr: format!("keypath segment `{seg}`"),
                    reason: "not a model-reference property".to_string(),
                })
            }
        }
    }
    let obj = ctx
        .scope
        .get_by_uuid(uuid)
        .await?
        .ok_or(ProcError::Scope(jetstream_model::ScopeError::TargetMissing(uuid)))?;
    obj.get(property)
        .map(|v| v.to_json())
        .ok_or_else(|| ProcError::EvalFailed {
            expr: format!("property `{property}`"),
            reason: "not declared on the resolved object".to_string(),
        })
}

fn eval_incoming(
    ctx: &ExprContext<'_>,
    class: &str,
    kind: FragmentKind,
    field: &str,
    index: &Option<IncomingIndex>,
) -> Result<Value, ProcError> {
    let frag = ctx
        .incoming
        .get(&(class.to_string(), kind))
        .and_then(|v| v.first())
        .ok_or_else(|| ProcError::EvalFailed {
            expr: format!("$incoming.{class}.{kind:?}.{field}"),
            reason: "no matching fragment in the incoming batch".to_string(),
        })?;

    let raw = frag.properties.get(field).cloned().unwrap_or(Value::Null);
    match index {
        None => Ok(raw),
        Some(IncomingIndex::Literal(i)) => {
            let arr = raw.as_array().ok_or_else(|| ProcError::EvalFailed {
                expr: format!("$incoming.{class}.{kind:?}.{field}[{i}]"),
                reason: "field is not a collection".to_string(),
            })?;
            index_into(arr, *i)
        }
        Some(IncomingIndex::Inserted(i)) => {
            let diff = diff_collection(ctx, frag.uuid, field, &raw, true);
            index_into(&diff, *i)
        }
        Some(IncomingIndex::Removed(i)) => {
            let diff = diff_collection(ctx, frag.uuid, field, &raw, false);
            index_into(&diff, *i)
        }
    }
}

/// Items present in `new` but not the prior live value (`inserted`), or vice
/// versa (`removed`). Equality is by JSON value — for model-ref collections
/// that means by UUID string, which is the identity comparison spec §4.5
/// calls for.
fn diff_collection(ctx: &ExprContext<'_>, owner: Uuid, field: &str, new: &Value, inserted: bool) -> Vec<Value> {
    let new_items: Vec<Value> = new.as_array().cloned().unwrap_or_default();
    let prior_items: Vec<Value> = ctx
        .prior
        .get(&owner)
        .and_then(|o| o.get(field))
        .map(|pv| pv.to_json())
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();
    if inserted {
        new_items.into_iter().filter(|v| !prior_items.contains(v)).collect()
    } else {
        prior_items.into_iter().filter(|v| !new_items.contains(v)).collect()
    }
}

fn index_into(items: &[Value], idx: i64) -> Result<Value, ProcError> {
    let len = items.len() as i64;
    let resolved = if idx >= 0 { idx } else { len + idx };
    if resolved < 0 || resolved >= len {
        return Err(ProcError::EvalFailed {
            expr: format!("index [{idx}]"),
            reason: format!("out of range for a collection of length {len}"),
        });
    }
    Ok(items[resolved as usize].clone())
}

fn parse_incoming(rest: &str) -> Result<Expr, ExpressionError> {
    let mut parts = rest.splitn(3, '.');
    let class = parts.next().ok_or_else(|| ExpressionError::Malformed(rest.to_string()))?;
    let kind_str = parts.next().ok_or_else(|| ExpressionError::Malformed(rest.to_string()))?;
    let field_part = parts.next().ok_or_else(|| ExpressionError::Malformed(rest.to_string()))?;
    let kind = match kind_str {
        "add" => FragmentKind::Add,
        "change" => FragmentKind::Change,
        "remove" => FragmentKind::Remove,
        "movechange" => FragmentKind::Movechange,
        "root" => FragmentKind::Root,
        other => return Err(ExpressionError::Malformed(format!("unknown fragment type `{other}`"))),
    };
    let (field, index) = parse_field_suffix(field_part)?;
    Ok(Expr::Incoming { class: class.to_string(), kind, field, index })
}

fn parse_field_suffix(raw: &str) -> Result<(String, Option<IncomingIndex>), ExpressionError> {
    match raw.find('[') {
        None => Ok((raw.to_string(), None)),
        Some(open) => {
            if !raw.ends_with(']') {
                return Err(ExpressionError::Malformed(raw.to_string()));
            }
            let field = raw[..open].to_string();
            let inner = &raw[open + 1..raw.len() - 1];
            let index = if let Some(n) = inner.strip_prefix("inserted[").and_then(|s| s.strip_suffix(']')) {
                IncomingIndex::Inserted(
                    n.parse().map_err(|_| ExpressionError::Malformed(raw.to_string()))?,
                )
            } else if let Some(n) = inner.strip_prefix("removed[").and_then(|s| s.strip_suffix(']')) {
                IncomingIndex::Removed(
                    n.parse().map_err(|_| ExpressionError::Malformed(raw.to_string()))?,
                )
            } else {
                IncomingIndex::Literal(
                    inner.parse().map_err(|_| ExpressionError::Malformed(raw.to_string()))?,
                )
            };
            Ok((field, Some(index)))
        }
    }
}

fn parse_keypath_and_property(rest: &str, build: impl FnOnce(Vec<String>, String) -> Expr) -> Expr {
    let mut segs: Vec<String> = rest.split('.').map(String::from).collect();
    let property = segs.pop().unwrap_or_default();
    build(segs, property)
}

/// Find the index (relative to `rest`, right after the already-consumed
/// opening paren) of the matching closing paren, honoring nested
/// parenthesized sub-expressions (`$model.find` / `$case` can nest).
fn find_matching_close(rest: &str, whole: &str) -> Result<usize, ExpressionError> {
    let mut depth = 1i32;
    for (i, c) in rest.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
    }
    Err(ExpressionError::Malformed(whole.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_incoming_with_literal_index() {
        let expr = Expr::parse("$incoming.Message.add.uuid").unwrap();
        assert_eq!(
            expr,
            Expr::Incoming {
                class: "Message".into(),
                kind: FragmentKind::Add,
                field: "uuid".into(),
                index: None,
            }
        );
    }

    #[test]
    fn parses_incoming_with_inserted_suffix() {
        let expr = Expr::parse("$incoming.ChatRoom.change.messages[inserted[0]]").unwrap();
        match expr {
            Expr::Incoming { index: Some(IncomingIndex::Inserted(0)), .. } => {}
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_root_model() {
        let expr = Expr::parse("$rootModel.attributes.locale").unwrap();
        assert_eq!(
            expr,
            Expr::RootModel { keypath: vec!["attributes".into()], property: "locale".into() }
        );
    }

    #[test]
    fn parses_scope_params() {
        let expr = Expr::parse("$scope.params.accessToken").unwrap();
        assert_eq!(expr, Expr::ScopeParams { keypath: vec!["accessToken".into()] });
    }

    #[test]
    fn parses_nested_model_find() {
        let expr = Expr::parse("$model.find($incoming.Message.add.author).name.displayName").unwrap();
        match expr {
            Expr::ModelFind { keypath, property, .. } => {
                assert_eq!(keypath, vec!["name".to_string()]);
                assert_eq!(property, "displayName");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_case_expression() {
        let expr = Expr::parse("$case.severity($incoming.Alert.add.level)").unwrap();
        match expr {
            Expr::Case { tag, .. } => assert_eq!(tag, "severity"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn unknown_form_is_malformed() {
        assert!(Expr::parse("$bogus.thing").is_err());
    }
}
