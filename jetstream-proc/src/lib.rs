//! Expression DSL, constraint matching, and procedure execution (spec §3,
//! §4.5): the layer between a raw sync-fragment batch and a side-effecting
//! remote call.

pub mod constraint;
pub mod error;
pub mod expression;
pub mod http_client;
pub mod procedure;

pub use constraint::{match_batch, Constraint, PropertyCondition, PropertyConstraint};
pub use error::{ExpressionError, ProcError, RemoteCallError};
pub use expression::{index_fragments, ExecOptions, Expr, ExprContext, FragmentsByKey, IncomingIndex, PriorSnapshot};
pub use http_client::{HttpClient, RemoteCallResponse, RemoteCallSpec};
pub use procedure::{
    apply_and_execute, Procedure, ProcedureOutcome, ProcedureRegistry, RawTemplateValue, RemoteCallTemplate,
    TemplateValue,
};

#[cfg(any(test, feature = "test-util"))]
pub use http_client::NoopHttpClient;
