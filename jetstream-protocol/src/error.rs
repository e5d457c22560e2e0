use thiserror::Error;

/// Errors surfaced while decoding wire frames (spec §4.6).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message frame: {0}")]
    MalformedJson(String),

    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),

    #[error("malformed `{type_tag}` message: {reason}")]
    MalformedMessage { type_tag: String, reason: String },
}

/// Errors surfaced while a session is being created or looked up (spec §4.7).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("scope fetch denied: {0}")]
    FetchDenied(String),

    #[error("unknown session token")]
    UnknownSession,

    #[error("session expired due to inactivity")]
    Expired,

    #[error(transparent)]
    Scope(#[from] jetstream_model::ScopeError),
}

/// Errors surfaced by the transport reliability layer (spec §4.8).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("underlying connection closed")]
    ConnectionClosed,

    #[error("failed to send on connection: {0}")]
    SendFailed(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
