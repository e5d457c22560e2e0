//! Response re-exports from Axum, plus the small SSE helpers `r2e-core`
//! layers on top.

pub use axum::response::{Html, IntoResponse, Redirect, Response};
pub use axum::response::sse::{Event as SseEvent, KeepAlive as SseKeepAlive, Sse};
