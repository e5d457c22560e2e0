//! Extractor re-exports from Axum.

pub use axum::extract::{
    ConnectInfo, DefaultBodyLimit, Form, FromRef, FromRequest, FromRequestParts, Path,
    Query, RawPathParams, Request, State,
};
pub use axum::extract::path::MatchedPath;
pub use axum::extract::OriginalUri;
