//! Error taxonomy for query operations, keyed to spec §7 (mostly
//! *Validation* and *Reference*).

use jetstream_model::ScopeError;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("update document must carry exactly one of $set/$push/$pull/$addToSet")]
    NotExactlyOneOperator,
    #[error("update document is not a JSON object")]
    MalformedUpdateDocument,
    #[error("malformed keypath `{0}`")]
    MalformedKeyPath(String),
    #[error("index {index} is out of range for a collection of length {len}")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("index on a non-collection property `{0}`")]
    IndexOnScalar(String),
    #[error("property `{0}` is not declared on `{1}`")]
    UnknownProperty(String, String),
    #[error("property `{0}` is declared with conflicting shapes across sibling descendants")]
    AmbiguousProperty(String),
    #[error("keypath resolves through a non-model-ref property `{0}`")]
    NotAModelRef(String),
    #[error("$push/$pull/$addToSet only apply to a collection property, `{0}` is scalar")]
    OperatorRequiresCollection(String),
    #[error("$set of a collection property must supply a whole replacement array")]
    SetOfCollectionNotAnArray,
    #[error(transparent)]
    Scope(#[from] ScopeError),
}
