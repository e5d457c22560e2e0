//! Procedures: constraint-guarded, expression-templated remote calls bound
//! to a model type (spec §3, §4.5).

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use jetstream_model::{ApplyOptions, FragmentOutcome, Scope, SyncFragment};
use serde_json::{Map, Value};

use crate::constraint::{match_batch, Constraint};
use crate::error::ProcError;
use crate::expression::{index_fragments, ExecOptions, Expr, ExprContext, PriorSnapshot};
use crate::http_client::{HttpClient, RemoteCallResponse, RemoteCallSpec};

/// A single remote-call template field: either a literal JSON value or an
/// unparsed expression string, as an embedder supplies it when registering
/// a procedure.
#[derive(Debug, Clone)]
pub enum RawTemplateValue {
    Literal(Value),
    Expr(String),
}

impl RawTemplateValue {
    fn parse(self) -> Result<TemplateValue, crate::error::ExpressionError> {
        match self {
            RawTemplateValue::Literal(v) => Ok(TemplateValue::Literal(v)),
            RawTemplateValue::Expr(raw) => Ok(TemplateValue::Expr(Expr::parse(&raw)?)),
        }
    }
}

/// Parsed form of one template field — a literal passes through unchanged,
/// an expression evaluates against the procedure's context tuple each time
/// the remote spec is resolved.
#[derive(Debug, Clone)]
pub enum TemplateValue {
    Literal(Value),
    Expr(Expr),
}

impl TemplateValue {
    async fn resolve(&self, ctx: &ExprContext<'_>) -> Result<Value, ProcError> {
        match self {
            TemplateValue::Literal(v) => Ok(v.clone()),
            TemplateValue::Expr(e) => e.eval(ctx).await,
        }
    }
}

/// A procedure's execution spec: URL, method, headers, and body as
/// expression/literal templates (spec §3: "whose URL, method, headers, and
/// body are templates containing expression placeholders").
#[derive(Debug, Clone)]
pub struct RemoteCallTemplate {
    pub url: String,
    pub method: String,
    url_params: HashMap<String, Expr>,
    headers: Vec<(String, TemplateValue)>,
    body: Vec<(String, TemplateValue)>,
}

impl RemoteCallTemplate {
    /// Parse every expression in the template up front — a malformed
    /// expression is a registration-time error, not a first-use surprise
    /// (SPEC_FULL §5).
    pub fn build(
        url: impl Into<String>,
        method: impl Into<String>,
        url_params: Vec<(String, String)>,
        headers: Vec<(String, RawTemplateValue)>,
        body: Vec<(String, RawTemplateValue)>,
    ) -> Result<Self, crate::error::ExpressionError> {
        let url_params = url_params
            .into_iter()
            .map(|(name, raw)| Ok((name, Expr::parse(&raw)?)))
            .collect::<Result<HashMap<_, _>, crate::error::ExpressionError>>()?;
        let headers = headers
            .into_iter()
            .map(|(k, v)| Ok((k, v.parse()?)))
            .collect::<Result<Vec<_>, crate::error::ExpressionError>>()?;
        let body = body
            .into_iter()
            .map(|(k, v)| Ok((k, v.parse()?)))
            .collect::<Result<Vec<_>, crate::error::ExpressionError>>()?;
        Ok(Self { url: url.into(), method: method.into(), url_params, headers, body })
    }

    /// Substitute every expression occurrence with its evaluated value
    /// (spec §4.5 step 2): `:name` URL placeholders, header values, and
    /// JSON body fields.
    pub async fn resolve(&self, ctx: &ExprContext<'_>) -> Result<RemoteCallSpec, ProcError> {
        let mut url = self.url.clone();
        for (name, expr) in &self.url_params {
            let value = expr.eval(ctx).await?;
            url = url.replace(&format!(":{name}"), &scalar_to_string(&value));
        }
        let mut headers = Vec::with_capacity(self.headers.len());
        for (name, tv) in &self.headers {
            headers.push((name.clone(), scalar_to_string(&tv.resolve(ctx).await?)));
        }
        let mut body = Map::new();
        for (name, tv) in &self.body {
            body.insert(name.clone(), tv.resolve(ctx).await?);
        }
        Ok(RemoteCallSpec { url, method: self.method.clone(), headers, body: Value::Object(body) })
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Named operation on a model type (spec §3): a constraint list plus an
/// execution spec.
#[derive(Debug, Clone)]
pub struct Procedure {
    pub name: String,
    pub model_type: String,
    pub constraints: Vec<Constraint>,
    pub template: RemoteCallTemplate,
}

impl Procedure {
    pub fn new(
        model_type: impl Into<String>,
        name: impl Into<String>,
        constraints: Vec<Constraint>,
        template: RemoteCallTemplate,
    ) -> Self {
        Self { name: name.into(), model_type: model_type.into(), constraints, template }
    }

    /// The `"Class.method"` key used to look procedures up by name (spec
    /// §4.6's `ScopeSync.procedure` field, §4.5's constraint/invocation
    /// lookup).
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.model_type, self.name)
    }
}

/// Registry of every declared procedure, keyed by `"Class.method"` —
/// mirrors `TypeRegistry`'s `DashMap` (SPEC_FULL §1): declaration happens
/// once at startup, lookups happen continuously under load.
#[derive(Default)]
pub struct ProcedureRegistry {
    procedures: DashMap<String, Arc<Procedure>>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, procedure: Procedure) {
        self.procedures.insert(procedure.qualified_name(), Arc::new(procedure));
    }

    pub fn get(&self, qualified_name: &str) -> Option<Arc<Procedure>> {
        self.procedures.get(qualified_name).map(|e| e.clone())
    }
}

/// Result of a full `applyProcedure` invocation (spec §4.3): the per-fragment
/// apply outcomes plus the remote call's response.
#[derive(Debug, Clone)]
pub struct ProcedureOutcome {
    pub fragment_outcomes: Vec<FragmentOutcome>,
    pub remote: RemoteCallResponse,
}

/// Verify the batch matches the named procedure's constraints, apply it,
/// then execute the procedure's remote spec (spec §4.3, §4.5).
///
/// Constraint matching happens *before* apply (so it reads the live prior
/// state for `array{insert|remove}` conditions); expression evaluation
/// happens *after* apply (so `$incoming` field values reflect what was
/// actually written), using the same pre-apply snapshot for `inserted`/
/// `removed` diffing.
pub async fn apply_and_execute(
    scope: &Scope,
    registry: &ProcedureRegistry,
    qualified_name: &str,
    fragments: Vec<SyncFragment>,
    apply_options: ApplyOptions,
    exec_options: &ExecOptions,
    http: &dyn HttpClient,
) -> Result<ProcedureOutcome, ProcError> {
    let procedure = registry
        .get(qualified_name)
        .ok_or_else(|| ProcError::UnknownProcedure(qualified_name.to_string()))?;

    let mut prior: PriorSnapshot = HashMap::new();
    for frag in &fragments {
        if let Some(obj) = scope.get_by_uuid(frag.uuid).await? {
            prior.insert(frag.uuid, obj);
        }
    }

    if !scope.disable_procedure_constraints() && !match_batch(&procedure.constraints, &fragments, &prior) {
        return Err(ProcError::ConstraintMismatch(procedure.qualified_name()));
    }

    let fragment_outcomes = scope.apply_sync_fragments(fragments.clone(), apply_options).await?;

    let indexed = index_fragments(&fragments);
    let ctx = ExprContext { scope, incoming: &indexed, options: exec_options, prior: &prior };
    let spec = procedure.template.resolve(&ctx).await?;
    let remote = http.call(spec).await?;

    Ok(ProcedureOutcome { fragment_outcomes, remote })
}
