//! Error taxonomy for the model kernel, keyed to spec §7's error kinds
//! (Reference, Validation, Concurrency, Backend). Protocol/Authorization
//! live one layer up, in `jetstream-protocol`.

use uuid::Uuid;

use crate::kernel::DeclareError;

/// Errors raised while resolving or mutating the type graph itself.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Declare(#[from] DeclareError),
    #[error("unknown model type `{0}`")]
    UnknownType(String),
    #[error("unknown enum `{0}`")]
    UnknownEnum(String),
}

/// Errors raised while building or validating a [`crate::fragment::SyncFragment`].
#[derive(Debug, thiserror::Error)]
pub enum FragmentError {
    #[error("late-bound fragment is missing its object uuid")]
    MissingUuid,
    #[error("late-bound fragment is missing its class name")]
    MissingClsName,
    #[error("unknown model type `{0}`")]
    UnknownType(String),
    #[error("property `{0}` is not declared on `{1}`")]
    UnknownProperty(String, String),
    #[error("property `{property}` expects a single value, got a collection")]
    UnexpectedCollection { property: String },
    #[error("property `{property}` expects a collection, got a single value")]
    ExpectedCollection { property: String },
    #[error("property `{property}` has the wrong value type for `{expected_kind}`")]
    TypeMismatch { property: String, expected_kind: String },
}

/// Errors raised while applying fragments against a [`crate::scope::Scope`],
/// spanning spec §7's Reference, Validation, Concurrency, and Backend kinds.
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    #[error("object `{0}` does not exist in this scope")]
    TargetMissing(Uuid),
    #[error("object `{0}` already exists in this scope")]
    AlreadyExists(Uuid),
    #[error("a procedure constraint rejected the batch: {0}")]
    ConstraintViolated(String),
    #[error("scope write lock held beyond its deadline")]
    WriteLockTimeout,
    #[error("persistence backend error: {0}")]
    Backend(String),
}
