//! HTTP abstraction layer for R2E — sole owner of the `axum` dependency.
//!
//! Crates elsewhere in the workspace that need `axum`'s types without
//! pulling the dependency in directly re-export it from here; the `ws`,
//! `multipart`, and `proxy` features forward onto `axum`'s own feature
//! flags of the same name.

pub use axum;

#[cfg(feature = "ws")]
pub use axum::extract::ws;

#[cfg(feature = "multipart")]
pub use axum::extract::Multipart;

#[cfg(feature = "proxy")]
pub use hyper;
