//! MongoDB-style query operations (`$set`/`$push`/`$pull`/`$addToSet`) that
//! translate into sync-fragment batches against a `jetstream_model::Scope`.

pub mod error;
pub mod keypath;
pub mod query;

pub use error::QueryError;
pub use keypath::{KeyPath, Segment};
pub use query::{execute, prepare_and_validate, Operator, PreparedUpdate, QueryResult};
