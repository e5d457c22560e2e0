//! Error taxonomy for the expression and procedure engine (spec §7's
//! *Validation* and *Remote* kinds, plus the construction-time failures
//! registering a malformed procedure raises).

use jetstream_model::ScopeError;

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("malformed expression `{0}`")]
    Malformed(String),
    #[error("unknown index suffix `{0}` in expression")]
    UnknownIndexSuffix(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    #[error("no procedure registered as `{0}`")]
    UnknownProcedure(String),
    #[error("batch does not satisfy the constraints of procedure `{0}`")]
    ConstraintMismatch(String),
    #[error("expression `{expr}` failed to evaluate: {reason}")]
    EvalFailed { expr: String, reason: String },
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error(transparent)]
    Remote(#[from] RemoteCallError),
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteCallError {
    #[error("remote call transport failure: {0}")]
    Transport(String),
    #[error("remote call returned non-2xx status {0}")]
    Status(u16),
}
