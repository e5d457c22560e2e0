//! Body re-exports from Axum.

pub use axum::body::Body;
