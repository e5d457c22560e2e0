//! Unified error type for the facade (SPEC_FULL §9's ambient error-handling
//! section): wraps every sub-crate's error taxonomy and delegates HTTP
//! rendering to `r2e_core::AppError` the same way the teacher's own
//! top-level errors do, rather than inventing a parallel response format.

use r2e_core::http::response::{IntoResponse, Response};
use r2e_core::AppError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Kernel(#[from] jetstream_model::KernelError),
    #[error(transparent)]
    Fragment(#[from] jetstream_model::FragmentError),
    #[error(transparent)]
    Scope(#[from] jetstream_model::ScopeError),
    #[error(transparent)]
    Query(#[from] jetstream_query::QueryError),
    #[error(transparent)]
    Proc(#[from] jetstream_proc::ProcError),
    #[error(transparent)]
    Session(#[from] jetstream_protocol::SessionError),
    #[error(transparent)]
    Transport(#[from] jetstream_protocol::TransportError),
    #[error(transparent)]
    Protocol(#[from] jetstream_protocol::ProtocolError),
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match &err {
            Error::Session(jetstream_protocol::SessionError::FetchDenied(_))
            | Error::Session(jetstream_protocol::SessionError::UnknownSession)
            | Error::Session(jetstream_protocol::SessionError::Expired) => {
                AppError::Forbidden(err.to_string())
            }
            Error::Protocol(_) => AppError::BadRequest(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        AppError::from(self).into_response()
    }
}
