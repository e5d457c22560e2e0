//! Session lifecycle: token issuance, scope binding, inactivity expiry
//! (spec §4.7).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use jetstream_model::ScopeHandle;
use rand::RngCore;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SessionError;
use crate::message::Message;
use crate::transport::Transport;

/// Opaque bearer token handed to a client on `SessionCreate` (spec §4.7:
/// "32 random bytes, base64url, no padding").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Looks up or creates the `ScopeHandle` a `ScopeFetch` names (spec §4.7's
/// `fetch(name, params, cb)`). The only collaborator interface this crate
/// defines without shipping an implementation — wiring it to a real
/// application's scope catalog is left to the embedder (SPEC_FULL §10).
#[async_trait]
pub trait ScopeFetcher: Send + Sync {
    async fn fetch(&self, name: &str, params: serde_json::Value) -> Result<ScopeHandle, SessionError>;
}

/// Decides whether a `SessionCreate` handshake is allowed to proceed (spec
/// §4.7/§4.6: `SessionCreateReply` carries either `sessionToken` or
/// `error`). Mirrors [`ScopeFetcher`] as a collaborator seam an embedder
/// supplies; the default accepts everything, matching the distilled spec's
/// silence on authentication.
#[async_trait]
pub trait SessionAcceptor: Send + Sync {
    async fn accept(&self, version: &str, params: &serde_json::Value) -> Result<(), String>;
}

/// The permissive default — every `SessionCreate` succeeds.
#[derive(Default)]
pub struct AllowAllAcceptor;

#[async_trait]
impl SessionAcceptor for AllowAllAcceptor {
    async fn accept(&self, _version: &str, _params: &serde_json::Value) -> Result<(), String> {
        Ok(())
    }
}

/// One scope bound into a session's ordered slot list (spec §4.7: "a
/// session may have more than one scope fetched; the wire addresses them by
/// the order they were fetched in"). `forward_task` drains the scope's
/// `changes` broadcast into the session's outbound queue for as long as the
/// binding lives; dropping the handle aborts it.
struct ScopeSlot {
    scope: ScopeHandle,
    forward_task: tokio::task::JoinHandle<()>,
}

impl Drop for ScopeSlot {
    fn drop(&mut self) {
        self.forward_task.abort();
    }
}

/// A single client's bound state: its identity, the ordered list of scopes
/// it has fetched, and the cancellation token its inactivity timer resets
/// on every inbound message.
pub struct SessionHandle {
    pub client_id: Uuid,
    pub token: SessionToken,
    /// The session's reliability state, owned here rather than by any one
    /// connection so it survives a reconnect (spec §4.8's index counter and
    /// non-acked backlog must outlive the socket that was open when they
    /// were created).
    transport: Arc<Transport>,
    scopes: RwLock<Vec<ScopeSlot>>,
    /// Outbound messages produced off the read loop — scope change
    /// fan-out, keepalive pings — funnel here so a single writer task owns
    /// the connection and the transport's index stamping stays ordered
    /// (spec §4.6: "composition of outgoing messages preserves input
    /// order"). Replaced wholesale on every `attach_connection` call so a
    /// resumed session's forwarder tasks always write to whichever
    /// connection is currently live.
    outbound_tx: RwLock<mpsc::UnboundedSender<Message>>,
    inactivity_reset: CancellationToken,
}

impl SessionHandle {
    fn new(token: SessionToken) -> Self {
        // Throwaway pair: the first real connection attaches its own via
        // `attach_connection` before anything is sent.
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        Self {
            client_id: Uuid::new_v4(),
            token,
            transport: Arc::new(Transport::new()),
            scopes: RwLock::new(Vec::new()),
            outbound_tx: RwLock::new(outbound_tx),
            inactivity_reset: CancellationToken::new(),
        }
    }

    /// The session's reliability layer, shared across every connection that
    /// ever serves it (spec §4.8).
    pub fn transport(&self) -> Arc<Transport> {
        self.transport.clone()
    }

    /// Channel end the dispatch layer and per-scope forwarder tasks use to
    /// enqueue an outbound message. Always targets whichever connection is
    /// currently attached.
    pub async fn outbound_sender(&self) -> mpsc::UnboundedSender<Message> {
        self.outbound_tx.read().await.clone()
    }

    /// Bind a freshly accepted (or resumed) connection's writer side to
    /// this session, returning the receiving half for its write loop to
    /// drain. Safe to call more than once per session — a reconnect simply
    /// swaps in a new pair, and any forwarder task blocked mid-send on the
    /// stale sender just finds its receiver dropped and exits (spec §4.8:
    /// "a new connection bearing a known sessionToken replaces the live
    /// connection on the existing transport").
    pub async fn attach_connection(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound_tx.write().await = tx;
        rx
    }

    /// Bind the next scope slot (spec §4.7). Spawns a background task that
    /// forwards every `changes` event from `scope` as a `ScopeState`-style
    /// sync to this session's outbound queue, suppressing events this same
    /// session originated (spec §4.7: "a fragment batch applied by a
    /// session is never echoed back to that same session").
    pub async fn bind_scope(self: &Arc<Self>, scope: ScopeHandle) -> u32 {
        let mut guard = self.scopes.write().await;
        let index = guard.len() as u32;
        let mut rx = scope.subscribe();
        let client_id = self.client_id;
        let session = self.clone();
        let forward_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.options.context.map(|c| c.client) == Some(client_id) {
                    continue;
                }
                let msg = Message::ScopeSync {
                    index: 0,
                    scope_index: index,
                    fragments: event.fragments,
                    atomic: None,
                    procedure: None,
                };
                if session.outbound_sender().await.send(msg).is_err() {
                    return;
                }
            }
        });
        guard.push(ScopeSlot { scope, forward_task });
        index
    }

    /// The scope bound at wire slot `index`, if any (spec §4.6's
    /// `scopeIndex` field on `ScopeSync`/`ScopeState`).
    pub async fn scope_at(&self, index: u32) -> Option<ScopeHandle> {
        self.scopes.read().await.get(index as usize).map(|slot| slot.scope.clone())
    }

    pub async fn scope_count(&self) -> usize {
        self.scopes.read().await.len()
    }

    /// Called on every inbound message; restarts the inactivity countdown
    /// by cancelling the current token so `run_inactivity_timer` loops and
    /// rearms a fresh one (spec §4.7: "the inactivity timer resets on
    /// every inbound message").
    pub fn touch(&self) {
        self.inactivity_reset.cancel();
    }

    fn reset_token(&self) -> CancellationToken {
        self.inactivity_reset.clone()
    }
}

/// Registry of live sessions keyed by token, mirroring `r2e_core::ws::WsRooms`'s
/// `DashMap<String, _>` shape (spec §4.7, supplemented per SPEC_FULL §7).
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<String, Arc<SessionHandle>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> Arc<SessionHandle> {
        let token = SessionToken::generate();
        let handle = Arc::new(SessionHandle::new(token));
        self.sessions.insert(handle.token.as_str().to_string(), handle.clone());
        handle
    }

    pub fn get(&self, token: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(token).map(|e| e.clone())
    }

    pub fn remove(&self, token: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(token).map(|(_, handle)| handle)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Drive one session's inactivity expiry loop (spec §4.7: "a session with
/// no inbound message for `inactivityTimeout` is closed"). Intended to run
/// as its own spawned task; returns once the session has genuinely expired
/// (no `touch()` call arrived within `timeout` of the last one) or
/// `external_cancel` fires first (the connection closed on its own).
pub async fn run_inactivity_timer(
    handle: Arc<SessionHandle>,
    timeout: Duration,
    external_cancel: CancellationToken,
) {
    loop {
        let reset_token = handle.reset_token();
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                tracing::info!(client_id = %handle.client_id, "session expired due to inactivity");
                return;
            }
            _ = reset_token.cancelled() => {
                // `touch()` fired: loop and start a fresh countdown.
                continue;
            }
            _ = external_cancel.cancelled() => {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jetstream_model::{InMemoryBackend, Scope, ScopeConfig};
    use std::sync::Arc as StdArc;

    #[test]
    fn tokens_are_unique_and_urlsafe() {
        let a = SessionToken::generate();
        let b = SessionToken::generate();
        assert_ne!(a.as_str(), b.as_str());
        assert!(!a.as_str().contains('+'));
        assert!(!a.as_str().contains('/'));
        assert!(!a.as_str().ends_with('='));
    }

    #[test]
    fn manager_create_get_remove_round_trip() {
        let mgr = SessionManager::new();
        let handle = mgr.create();
        let token = handle.token.as_str().to_string();
        assert!(mgr.get(&token).is_some());
        assert_eq!(mgr.len(), 1);
        mgr.remove(&token);
        assert!(mgr.get(&token).is_none());
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn inactivity_timer_fires_after_timeout_without_touch() {
        let mgr = SessionManager::new();
        let handle = mgr.create();
        let external = CancellationToken::new();
        let fired = tokio::time::timeout(
            Duration::from_millis(200),
            run_inactivity_timer(handle, Duration::from_millis(20), external),
        )
        .await;
        assert!(fired.is_ok());
    }

    #[tokio::test]
    async fn touch_resets_the_countdown() {
        let mgr = SessionManager::new();
        let handle = mgr.create();
        let external = CancellationToken::new();
        let timer_handle = handle.clone();
        let timer = tokio::spawn(run_inactivity_timer(timer_handle, Duration::from_millis(50), external));
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.touch();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!timer.is_finished());
        timer.abort();
    }

    fn test_scope() -> ScopeHandle {
        let registry = jetstream_model::TypeRegistry::new();
        registry.define_model_type("Thing", None, |_| {}).unwrap();
        StdArc::new(Scope::new(
            "test",
            serde_json::Value::Null,
            StdArc::new(registry),
            StdArc::new(InMemoryBackend::new()),
            ScopeConfig::default(),
        ))
    }

    /// A trivial `add` fragment applying cleanly against [`test_scope`]'s
    /// registry, for tests that need a real `changes` broadcast (an empty
    /// fragment batch applies nothing and never emits one).
    fn add_fragment() -> jetstream_model::SyncFragment {
        jetstream_model::SyncFragment::new(jetstream_model::FragmentKind::Add, Uuid::new_v4(), "Thing")
    }

    #[tokio::test]
    async fn binding_scopes_assigns_sequential_slot_indices() {
        let mgr = SessionManager::new();
        let handle = mgr.create();
        let first = handle.bind_scope(test_scope()).await;
        let second = handle.bind_scope(test_scope()).await;
        assert_eq!(first, 0);
        assert_eq!(second, 1);
        assert_eq!(handle.scope_count().await, 2);
    }

    #[tokio::test]
    async fn own_changes_are_suppressed_from_outbound() {
        let mgr = SessionManager::new();
        let handle = mgr.create();
        let scope = test_scope();
        handle.bind_scope(scope.clone()).await;
        let mut outbound = handle.attach_connection().await;

        scope
            .apply_sync_fragments(
                vec![add_fragment()],
                jetstream_model::ApplyOptions {
                    atomic: false,
                    context: Some(jetstream_model::ApplyContext { client: handle.client_id }),
                },
            )
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_millis(100), outbound.recv()).await;
        assert!(result.is_err(), "own-originated change should not be forwarded");
    }

    #[tokio::test]
    async fn foreign_changes_are_forwarded() {
        let mgr = SessionManager::new();
        let handle = mgr.create();
        let scope = test_scope();
        handle.bind_scope(scope.clone()).await;
        let mut outbound = handle.attach_connection().await;

        scope
            .apply_sync_fragments(
                vec![add_fragment()],
                jetstream_model::ApplyOptions {
                    atomic: false,
                    context: Some(jetstream_model::ApplyContext { client: Uuid::new_v4() }),
                },
            )
            .await
            .unwrap();

        let forwarded = tokio::time::timeout(Duration::from_millis(100), outbound.recv()).await;
        assert!(forwarded.is_ok());
        assert!(matches!(forwarded.unwrap(), Some(Message::ScopeSync { scope_index: 0, .. })));
    }
}
