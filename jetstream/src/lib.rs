//! Jetstream: real-time synchronization of typed object graphs between a
//! server and many remote clients.
//!
//! This facade re-exports the four layers of the stack —
//! [`jetstream_model`] (object graph, fragments, scope apply pipeline),
//! [`jetstream_query`] (`$set`/`$push`/`$pull`/`$addToSet`), [`jetstream_proc`]
//! (constraint-guarded remote-call procedures), and [`jetstream_protocol`]
//! (wire messages, sessions, transport reliability, dispatch) — plus the
//! glue that wires a [`jetstream_protocol::Dispatcher`] onto a live Axum
//! websocket the way `r2e-core`'s own `WsStream`-based controllers do.

pub mod error;

pub use error::Error;

pub use jetstream_model::{
    ApplyContext, ApplyOptions, ChangeEvent, ChangeReceiver, FragmentKind, FragmentOutcome,
    InMemoryBackend, LateBoundFragment, ModelObject, PersistenceBackend, PropertyDescriptor,
    PropertyKind, PropertyValue, Scope, ScopeConfig, ScopeCursor, ScopeHandle, SyncFragment,
    TypeBuilder, TypeRegistry,
};
pub use jetstream_proc::{
    apply_and_execute, Constraint, ExecOptions, HttpClient, Procedure, ProcedureOutcome,
    ProcedureRegistry, RemoteCallResponse, RemoteCallSpec, RemoteCallTemplate,
};
pub use jetstream_protocol::{
    AllowAllAcceptor, ConnectionDriver, Dispatcher, InMemoryScopeCatalog, JetstreamConfig, Message,
    ScopeFetcher, SessionAcceptor, SessionHandle, SessionManager, SessionToken, Transport,
};
pub use jetstream_query::{execute as execute_query, prepare_and_validate, Operator, QueryResult};

#[cfg(feature = "ws")]
pub use jetstream_protocol::WsConnection;

/// Drive one accepted websocket connection through the full Jetstream
/// message catalog until it closes (spec §4.6-§4.8's connection lifecycle).
///
/// `resume_token` is whatever the embedder pulled off the upgrade request's
/// `sessionToken` query parameter or `x-jetstream-session-token` header
/// (spec §4.7/§4.8); pass `None` for a first-time connection. When it names
/// a still-live session, the connection resumes that session's existing
/// transport state in place instead of requiring a fresh `SessionCreate`
/// handshake — the reconnecting client's leading
/// `Ping { ack, resendMissing: true }` then triggers the usual resend path.
///
/// Call this from the body of a `#[ws(...)]` handler, the same way
/// `ChatController::join_room` drives its own protocol directly over the
/// `WsStream` it's handed — Jetstream's reliability and session machinery
/// lives in [`jetstream_protocol::ConnectionDriver`], not in a callback the
/// caller has to implement:
///
/// ```ignore
/// #[derive(Controller)]
/// #[controller(path = "/jetstream", state = AppState)]
/// pub struct JetstreamController {
///     #[inject]
///     dispatcher: std::sync::Arc<jetstream::Dispatcher>,
/// }
///
/// #[routes]
/// impl JetstreamController {
///     #[ws("/connect")]
///     async fn connect(&self, Query(q): Query<ConnectParams>, ws: WsStream) {
///         jetstream::serve_ws(ws, self.dispatcher.clone(), q.session_token).await;
///     }
/// }
/// ```
#[cfg(feature = "ws")]
pub async fn serve_ws(
    ws: r2e_core::ws::WsStream,
    dispatcher: std::sync::Arc<Dispatcher>,
    resume_token: Option<String>,
) {
    let conn: Box<dyn jetstream_protocol::Connection> = Box::new(WsConnection::new(ws));
    ConnectionDriver::new(dispatcher).run(conn, resume_token).await;
}
