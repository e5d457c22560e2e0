//! Session lifecycle, the wire message catalog, transport reliability, and
//! the request dispatch that ties them to a live connection (spec
//! §4.6-§4.8).
//!
//! [`jetstream_model`] and [`jetstream_proc`] describe what a scope is and
//! how a batch of fragments gets applied to it; this crate describes how a
//! remote client's bytes turn into those calls and back again.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod session;
pub mod transport;

pub use config::JetstreamConfig;
pub use dispatch::{ConnectionDriver, Dispatcher, InMemoryScopeCatalog};
pub use error::{ProtocolError, SessionError, TransportError};
pub use message::{
    FragmentReplyWire, Message, OutboundQueue, ScopeFetchResult, SessionCreateResult, parse_batch,
};
pub use session::{
    run_inactivity_timer, AllowAllAcceptor, ScopeFetcher, SessionAcceptor, SessionHandle, SessionManager,
    SessionToken,
};
pub use transport::{Connection, Transport};

#[cfg(feature = "ws")]
pub use transport::WsConnection;
