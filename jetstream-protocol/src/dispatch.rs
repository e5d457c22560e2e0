//! Message-level request handling and the per-connection driver loop (spec
//! §4.6-§4.8, supplemented per SPEC_FULL §4). Everything below this module
//! is reusable protocol machinery; this is where it is wired into the
//! handshake/fetch/sync request flow a real connection actually drives.

use std::collections::HashMap;
use std::sync::Arc;

use jetstream_model::{ApplyContext, ApplyOptions, FragmentOutcome, ScopeHandle};
use jetstream_proc::{apply_and_execute, ExecOptions, HttpClient, ProcedureRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::JetstreamConfig;
use crate::message::{FragmentReplyWire, Message, ScopeFetchResult, SessionCreateResult};
use crate::session::{run_inactivity_timer, ScopeFetcher, SessionAcceptor, SessionHandle, SessionManager};
use crate::transport::{Connection, Transport};

/// Everything a connection needs to answer the message catalog: the session
/// registry, the embedder's scope catalog and accept policy, the procedure
/// registry shared across every scope, and the remote-call client procedures
/// invoke (spec §6's collaborator list).
pub struct Dispatcher {
    pub sessions: Arc<SessionManager>,
    pub scopes: Arc<dyn ScopeFetcher>,
    pub acceptor: Arc<dyn SessionAcceptor>,
    pub procedures: Arc<ProcedureRegistry>,
    pub http: Arc<dyn HttpClient>,
    pub config: JetstreamConfig,
}

impl Dispatcher {
    /// `SessionCreate` -> `SessionCreateReply` (spec §4.7). On acceptance, a
    /// fresh [`SessionHandle`] is registered and its inactivity timer is
    /// spawned for the life of the session — not just the life of this one
    /// connection, since a reconnect reuses the same handle without
    /// re-running this method. The caller still owns wiring the connection
    /// itself via `SessionHandle::attach_connection`.
    pub async fn handle_session_create(
        &self,
        reply_to: u64,
        version: &str,
        params: &serde_json::Value,
    ) -> (Message, Option<Arc<SessionHandle>>) {
        match self.acceptor.accept(version, params).await {
            Ok(()) => {
                let handle = self.sessions.create();
                let msg = Message::SessionCreateReply {
                    index: 0,
                    reply_to,
                    result: SessionCreateResult::Ok { session_token: handle.token.to_string() },
                };
                self.spawn_inactivity_timer(&handle);
                (msg, Some(handle))
            }
            Err(reason) => {
                let msg = Message::SessionCreateReply {
                    index: 0,
                    reply_to,
                    result: SessionCreateResult::Err { error: reason },
                };
                (msg, None)
            }
        }
    }

    /// Run the session's inactivity countdown for its whole lifetime,
    /// evicting it from the registry and tearing down its transport once it
    /// genuinely expires (spec §4.7). A currently-attached connection's
    /// `drive_session` loop observes the same transport cancellation token
    /// and exits cleanly; any later reconnect attempt with this token then
    /// fails the `sessions.get` lookup the normal way.
    fn spawn_inactivity_timer(&self, handle: &Arc<SessionHandle>) {
        let sessions = self.sessions.clone();
        let token = handle.token.as_str().to_string();
        let timer_handle = handle.clone();
        let transport = handle.transport();
        let timeout = self.config.inactivity_timeout();
        tokio::spawn(async move {
            run_inactivity_timer(timer_handle, timeout, CancellationToken::new()).await;
            sessions.remove(&token);
            transport.shutdown();
        });
    }

    /// `ScopeFetch` -> `ScopeFetchReply` followed by `ScopeState` (spec
    /// §4.7): on success the fetched scope is appended to the session's
    /// slot list, then a `ScopeState` fragment snapshot of its full
    /// reachable graph is composed so the replies queue in the documented
    /// order.
    pub async fn handle_scope_fetch(
        &self,
        session: &Arc<SessionHandle>,
        reply_to: u64,
        name: &str,
        params: serde_json::Value,
    ) -> Vec<Message> {
        match self.scopes.fetch(name, params).await {
            Ok(scope) => {
                let scope_index = session.bind_scope(scope.clone()).await;
                let reply = Message::ScopeFetchReply {
                    index: 0,
                    reply_to,
                    result: ScopeFetchResult::Ok { scope_index },
                };
                let state = self.build_scope_state(scope_index, &scope).await;
                match state {
                    Some(state) => vec![reply, state],
                    None => vec![reply],
                }
            }
            Err(e) => vec![Message::ScopeFetchReply {
                index: 0,
                reply_to,
                result: ScopeFetchResult::Err { error: e.to_string() },
            }],
        }
    }

    /// Walk every object reachable from `scope`'s root and describe it as
    /// one `add` fragment, with the root's own fragment coerced to `change`
    /// so a reconnecting client can reconcile against a root it already
    /// holds (spec §4.7).
    async fn build_scope_state(&self, scope_index: u32, scope: &ScopeHandle) -> Option<Message> {
        let root_uuid = scope.get_root().await?;
        let mut visited = std::collections::HashSet::new();
        let mut queue = vec![root_uuid];
        visited.insert(root_uuid);
        let mut fragments = Vec::new();
        while let Some(uuid) = queue.pop() {
            let Ok(Some(obj)) = scope.get_by_uuid(uuid).await else { continue };
            for next in obj.outgoing_refs() {
                if visited.insert(next) {
                    queue.push(next);
                }
            }
            let mut frag = jetstream_model::SyncFragment::from_object(&obj);
            if uuid == root_uuid {
                frag.kind = jetstream_model::FragmentKind::Change;
            }
            fragments.push(frag);
        }
        Some(Message::ScopeState { index: 0, scope_index, root_uuid, fragments })
    }

    /// `ScopeSync` -> `ScopeSyncReply` (spec §4.3, §4.5): a plain sync goes
    /// straight to `Scope::apply_sync_fragments`; a `procedure` name routes
    /// through `jetstream_proc::apply_and_execute` so constraints gate the
    /// batch and the remote call fires after apply.
    pub async fn handle_scope_sync(
        &self,
        session: &Arc<SessionHandle>,
        reply_to: u64,
        scope_index: u32,
        fragments: Vec<jetstream_model::SyncFragment>,
        atomic: Option<bool>,
        procedure: Option<String>,
    ) -> Message {
        let Some(scope) = session.scope_at(scope_index).await else {
            let n = fragments.len();
            return Message::ScopeSyncReply {
                index: 0,
                reply_to,
                fragment_replies: (0..n)
                    .map(|_| FragmentReplyWire::Err { error: "unknown scopeIndex".to_string() })
                    .collect(),
            };
        };

        let options = ApplyOptions {
            atomic: atomic.unwrap_or(false),
            context: Some(ApplyContext { client: session.client_id }),
        };

        let outcomes = match procedure {
            Some(qualified_name) => {
                match apply_and_execute(
                    &scope,
                    &self.procedures,
                    &qualified_name,
                    fragments.clone(),
                    options,
                    &ExecOptions::default(),
                    self.http.as_ref(),
                )
                .await
                {
                    Ok(outcome) => outcome.fragment_outcomes,
                    Err(e) => fragments.iter().map(|_| FragmentOutcome::Error(e.to_string())).collect(),
                }
            }
            None => match scope.apply_sync_fragments(fragments.clone(), options).await {
                Ok(outcomes) => outcomes,
                Err(e) => fragments.iter().map(|_| FragmentOutcome::Error(e.to_string())).collect(),
            },
        };

        Message::ScopeSyncReply {
            index: 0,
            reply_to,
            fragment_replies: outcomes.iter().map(FragmentReplyWire::from).collect(),
        }
    }
}

/// Drives one live connection end to end: reads inbound frames through the
/// [`Transport`], dispatches them, and writes every reply plus whatever the
/// session's per-scope forwarder tasks enqueue, in enqueue order (spec
/// §4.6's outbound ordering guarantee). Runs until the connection closes or
/// the session expires from inactivity.
#[derive(Clone)]
pub struct ConnectionDriver {
    dispatcher: Arc<Dispatcher>,
}

impl ConnectionDriver {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Run one connection end to end. `resume_token`, when present, is a
    /// `sessionToken` the embedder pulled off the upgrade request's query
    /// parameter or `x-jetstream-*` header (spec §4.7/§4.8) — when it names
    /// a live session this connection resumes it in place rather than
    /// performing a fresh `SessionCreate` handshake, and the reconnecting
    /// client's leading `Ping { ack, resendMissing }` flows through the
    /// normal inbound path in `drive_session`, which already knows how to
    /// answer it. An unknown or absent token falls back to requiring
    /// `SessionCreate` as the first message, same as a brand new connection
    /// (spec §4.7).
    pub async fn run(&self, mut conn: Box<dyn Connection>, resume_token: Option<String>) {
        let resumed = resume_token.as_deref().and_then(|t| self.dispatcher.sessions.get(t));

        let session = match resumed {
            Some(session) => session,
            None => {
                let Some(first) = conn.recv().await else { return };
                let Message::SessionCreate { version, params, .. } = first else { return };
                let (reply, session) = self.dispatcher.handle_session_create(0, &version, &params).await;
                if conn.send(&reply).await.is_err() {
                    return;
                }
                let Some(session) = session else { return };
                session
            }
        };

        let transport = session.transport();
        let outbound_rx = session.attach_connection().await;
        session.touch();

        self.drive_session(conn, session, transport, outbound_rx).await;
    }

    async fn drive_session(
        &self,
        mut conn: Box<dyn Connection>,
        session: Arc<SessionHandle>,
        transport: Arc<Transport>,
        mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    ) {
        let keepalive_cancel = transport.cancellation();
        let keepalive_base = self.dispatcher.config.keepalive_interval();
        let keepalive_variance = self.dispatcher.config.keepalive_variance();

        loop {
            let keepalive_delay = Transport::next_keepalive_delay(keepalive_base, keepalive_variance);
            tokio::select! {
                inbound = conn.recv() => {
                    let Some(msg) = inbound else { break };
                    session.touch();
                    let resend_requested = matches!(&msg, Message::Ping { resend_missing: Some(true), .. });
                    let is_ping = msg.is_ping();
                    let delivered = transport.handle_inbound(msg).await;
                    if is_ping {
                        // `delivered` is the non-acked backlog to replay
                        // verbatim, not a request to dispatch (spec §4.8's
                        // reconnect resend path, testable property 4): own
                        // ack first, then the backlog in order (spec S4).
                        if resend_requested {
                            let ping = transport.make_ping().await;
                            if conn.send(&ping).await.is_err() {
                                return;
                            }
                        }
                        for resend in delivered {
                            if conn.send(&resend).await.is_err() {
                                return;
                            }
                        }
                        continue;
                    }
                    for delivered in delivered {
                        if let Some(reply) = self.handle_message(&session, delivered).await {
                            let stamped = transport.stamp_outbound(reply).await;
                            if conn.send(&stamped).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                outbound = outbound_rx.recv() => {
                    let Some(msg) = outbound else { break };
                    let stamped = transport.stamp_outbound(msg).await;
                    if conn.send(&stamped).await.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(keepalive_delay) => {
                    let ping = transport.make_ping().await;
                    if conn.send(&ping).await.is_err() {
                        return;
                    }
                }
                _ = keepalive_cancel.cancelled() => {
                    break;
                }
            }
        }
    }

    async fn handle_message(&self, session: &Arc<SessionHandle>, msg: Message) -> Option<Message> {
        match msg {
            Message::SessionCreate { .. } => None,
            Message::ScopeFetch { index, name, params } => {
                let mut replies = self.dispatcher.handle_scope_fetch(session, index, &name, params).await;
                if replies.len() > 1 {
                    let state = replies.pop();
                    let reply = replies.pop()?;
                    if let Some(state) = state {
                        let _ = session.outbound_sender().await.send(state);
                    }
                    Some(reply)
                } else {
                    replies.pop()
                }
            }
            Message::ScopeSync { index, scope_index, fragments, atomic, procedure } => Some(
                self.dispatcher
                    .handle_scope_sync(session, index, scope_index, fragments, atomic, procedure)
                    .await,
            ),
            Message::Ping { .. } => None,
            Message::SessionCreateReply { .. }
            | Message::ScopeFetchReply { .. }
            | Message::ScopeState { .. }
            | Message::ScopeSyncReply { .. }
            | Message::Reply { .. } => {
                tracing::debug!("ignoring server-originated message type received from client");
                None
            }
        }
    }
}

/// Map scope lookups into per-client tables for embedders whose scope
/// catalog is small enough to keep in memory (SPEC_FULL §10's example
/// `ScopeFetcher`, not required by the distilled spec but useful for tests
/// and demos).
pub struct InMemoryScopeCatalog {
    scopes: std::sync::Mutex<HashMap<String, ScopeHandle>>,
}

impl InMemoryScopeCatalog {
    pub fn new() -> Self {
        Self { scopes: std::sync::Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, name: impl Into<String>, scope: ScopeHandle) {
        self.scopes.lock().unwrap().insert(name.into(), scope);
    }
}

impl Default for InMemoryScopeCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ScopeFetcher for InMemoryScopeCatalog {
    async fn fetch(
        &self,
        name: &str,
        _params: serde_json::Value,
    ) -> Result<ScopeHandle, crate::error::SessionError> {
        self.scopes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| crate::error::SessionError::FetchDenied(format!("no scope named `{name}`")))
    }
}
