//! Middleware re-exports from Axum.

pub use axum::middleware::{from_fn, Next};
