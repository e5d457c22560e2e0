//! The scope: object registry, apply pipeline, change broadcast, write lock
//! (spec §4.3).
//!
//! Everything that mutates a scope's object graph goes through
//! [`Scope::apply_sync_fragments`], which holds `write_lock` for the whole
//! batch — resolve, verify, apply, recompute reachability, and emit, in that
//! order (spec §4.3's five-step pipeline). Reads that don't mutate
//! ([`Scope::get_by_uuid`]) go straight to the [`PersistenceBackend`]
//! without taking the lock, since the backend owns its own consistency.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::error::ScopeError;
use crate::fragment::{FragmentKind, SyncFragment};
use crate::kernel::{PropertyKind, PropertyName, PropertyValue, TypeRegistry};

/// Tunables for a scope, split out so an embedder can override the
/// broadcast channel capacity per scope without touching construction
/// order (mirrors the teacher's `WsRooms::new(capacity_per_room)`).
#[derive(Debug, Clone)]
pub struct ScopeConfig {
    pub broadcast_capacity: usize,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self { broadcast_capacity: 256 }
    }
}

/// The `options.context = { client }` marker spec §4.7 describes: the
/// originating session, carried through `apply_sync_fragments` so the
/// session layer can suppress echoing a batch back to its author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApplyContext {
    pub client: Uuid,
}

/// Per-call options for [`Scope::apply_sync_fragments`].
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// When set, the first per-fragment failure aborts the whole batch with
    /// no mutation visible (spec §4.3 step 2).
    pub atomic: bool,
    pub context: Option<ApplyContext>,
}

/// Per-fragment result delivered by the apply pipeline (spec §4.3:
/// "callback delivers per-fragment results: `{ok}` or `{error}`"). Carries
/// the error's `Display` text rather than the `ScopeError` itself so it is
/// cheap to clone into a wire reply (`jetstream-protocol::ScopeSyncReply`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    Ok,
    Error(String),
}

impl FragmentOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, FragmentOutcome::Ok)
    }
}

/// Broadcast to every `changes` subscriber after a successful apply (spec
/// §4.3: "Emits a `changes` event: `(appliedFragments, options)`").
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub fragments: Vec<SyncFragment>,
    pub options: ApplyOptions,
}

/// Thin wrapper around a `broadcast::Receiver` that drops `Lagged` errors by
/// resubscribing rather than surfacing them — a slow session should miss
/// intermediate broadcasts, not have its whole connection error out.
pub struct ChangeReceiver {
    rx: broadcast::Receiver<ChangeEvent>,
}

impl ChangeReceiver {
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Persistence backend contract (spec §6). Implementations must be safe to
/// call while the scope's write lock is held — the in-memory backend this
/// crate ships is, since its own storage (`DashMap`) is already internally
/// synchronized, but a real backend talking to a database would need its
/// own connection-level isolation.
///
/// `all_uuids` and `set_binding` are supplemented beyond spec §6's six
/// methods: the reachability recompute in apply step 4 needs to enumerate
/// every stored object to find ones no longer reachable (the distilled spec
/// leaves that enumeration implicit, "recomputed" without naming how), and
/// needs somewhere to record the `Attached`/`Detached` transition that
/// recompute produces (spec §4.1).
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn add_model_object(&self, obj: crate::kernel::ModelObject) -> Result<(), ScopeError>;
    async fn remove_model_object(&self, uuid: Uuid) -> Result<(), ScopeError>;
    async fn update_model_object(
        &self,
        uuid: Uuid,
        changed: HashMap<PropertyName, PropertyValue>,
    ) -> Result<(), ScopeError>;
    async fn contains_model_object_with_uuid(&self, uuid: Uuid) -> Result<bool, ScopeError>;
    async fn get_model_object_by_uuid(
        &self,
        uuid: Uuid,
    ) -> Result<Option<crate::kernel::ModelObject>, ScopeError>;
    async fn get_model_objects_by_uuids(
        &self,
        uuids: &[Uuid],
    ) -> Result<Vec<crate::kernel::ModelObject>, ScopeError>;
    async fn all_uuids(&self) -> Result<Vec<Uuid>, ScopeError>;
    /// Record the `Attached`/`Detached` transition (spec §4.1) an object
    /// underwent during the reachability recompute. A no-op if the uuid is
    /// no longer present (it is about to be, or already was, removed).
    async fn set_binding(&self, uuid: Uuid, binding: crate::kernel::ScopeBinding) -> Result<(), ScopeError>;
}

/// The only backend this crate ships ("Persistence beyond an in-memory
/// backend is not required" — spec §1). A `DashMap` gives lock-free reads
/// under the scope's own write lock, the same reasoning `TypeRegistry` uses
/// for its type table.
#[derive(Default)]
pub struct InMemoryBackend {
    objects: DashMap<Uuid, crate::kernel::ModelObject>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceBackend for InMemoryBackend {
    async fn add_model_object(&self, obj: crate::kernel::ModelObject) -> Result<(), ScopeError> {
        if self.objects.contains_key(&obj.uuid) {
            return Err(ScopeError::AlreadyExists(obj.uuid));
        }
        self.objects.insert(obj.uuid, obj);
        Ok(())
    }

    async fn remove_model_object(&self, uuid: Uuid) -> Result<(), ScopeError> {
        self.objects.remove(&uuid);
        Ok(())
    }

    async fn update_model_object(
        &self,
        uuid: Uuid,
        changed: HashMap<PropertyName, PropertyValue>,
    ) -> Result<(), ScopeError> {
        let mut entry = self.objects.get_mut(&uuid).ok_or(ScopeError::TargetMissing(uuid))?;
        for (name, value) in changed {
            entry.set(name, value);
        }
        Ok(())
    }

    async fn contains_model_object_with_uuid(&self, uuid: Uuid) -> Result<bool, ScopeError> {
        Ok(self.objects.contains_key(&uuid))
    }

    async fn get_model_object_by_uuid(
        &self,
        uuid: Uuid,
    ) -> Result<Option<crate::kernel::ModelObject>, ScopeError> {
        Ok(self.objects.get(&uuid).map(|e| e.clone()))
    }

    async fn get_model_objects_by_uuids(
        &self,
        uuids: &[Uuid],
    ) -> Result<Vec<crate::kernel::ModelObject>, ScopeError> {
        Ok(uuids.iter().filter_map(|u| self.objects.get(u).map(|e| e.clone())).collect())
    }

    async fn all_uuids(&self) -> Result<Vec<Uuid>, ScopeError> {
        Ok(self.objects.iter().map(|e| *e.key()).collect())
    }

    async fn set_binding(&self, uuid: Uuid, binding: crate::kernel::ScopeBinding) -> Result<(), ScopeError> {
        if let Some(mut entry) = self.objects.get_mut(&uuid) {
            match binding {
                crate::kernel::ScopeBinding::Attached(root) => entry.attach(root),
                crate::kernel::ScopeBinding::Detached => entry.detach(),
            }
        }
        Ok(())
    }
}

struct ScopeState {
    root: Option<Uuid>,
}

/// A held write lock plus the scope it guards, handed to a closure by
/// [`Scope::with_write_lock`]. Exposes the same reads `get_by_uuid` offers
/// (the backend is safe to read while the lock is held — it is the lock's
/// whole job to serialize writers, not readers) plus `apply`, which runs
/// the same five-step pipeline as [`Scope::apply_sync_fragments`] without
/// re-acquiring the mutex.
pub struct ScopeCursor<'a> {
    scope: &'a Scope,
    guard: tokio::sync::MutexGuard<'a, ScopeState>,
}

impl<'a> ScopeCursor<'a> {
    pub fn scope(&self) -> &'a Scope {
        self.scope
    }

    pub fn root(&self) -> Option<Uuid> {
        self.guard.root
    }

    pub async fn get_by_uuid(&self, uuid: Uuid) -> Result<Option<crate::kernel::ModelObject>, ScopeError> {
        self.scope.backend.get_model_object_by_uuid(uuid).await
    }

    pub async fn apply(
        &mut self,
        fragments: Vec<SyncFragment>,
        options: ApplyOptions,
    ) -> Result<Vec<FragmentOutcome>, ScopeError> {
        self.scope.apply_locked(&mut self.guard, fragments, options).await
    }
}

/// Shared handle to a [`Scope`], the shape every collaborator above this
/// crate passes around (a session's bound-scope list, a query operation's
/// target, a procedure's execution context) — cloning is an `Arc` bump, not
/// a deep copy.
pub type ScopeHandle = Arc<Scope>;

/// A named container owning a root object and its reachable graph (spec
/// §3, §4.3).
pub struct Scope {
    pub uuid: Uuid,
    pub name: String,
    pub params: Value,
    registry: Arc<TypeRegistry>,
    backend: Arc<dyn PersistenceBackend>,
    write_lock: Mutex<ScopeState>,
    changes_tx: broadcast::Sender<ChangeEvent>,
    /// Supplemented from the original design (SPEC_FULL §3): lets a test
    /// harness or migration tool replay historical batches without
    /// re-satisfying constraints authored after the fact.
    disable_procedure_constraints: AtomicBool,
}

impl Scope {
    pub fn new(
        name: impl Into<String>,
        params: Value,
        registry: Arc<TypeRegistry>,
        backend: Arc<dyn PersistenceBackend>,
        config: ScopeConfig,
    ) -> Self {
        let (changes_tx, _) = broadcast::channel(config.broadcast_capacity);
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            params,
            registry,
            backend,
            write_lock: Mutex::new(ScopeState { root: None }),
            changes_tx,
            disable_procedure_constraints: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn disable_procedure_constraints(&self) -> bool {
        self.disable_procedure_constraints.load(Ordering::Acquire)
    }

    pub fn set_disable_procedure_constraints(&self, value: bool) {
        self.disable_procedure_constraints.store(value, Ordering::Release);
    }

    pub async fn get_root(&self) -> Option<Uuid> {
        self.write_lock.lock().await.root
    }

    /// Set once; setting replaces all attached objects (spec §4.3). The
    /// caller must have already placed `obj` (and anything it references)
    /// in the backend — this just anchors reachability at its uuid.
    pub async fn set_root(&self, root_uuid: Uuid) -> Result<(), ScopeError> {
        if !self.backend.contains_model_object_with_uuid(root_uuid).await? {
            return Err(ScopeError::TargetMissing(root_uuid));
        }
        let mut state = self.write_lock.lock().await;
        let previous = state.root.replace(root_uuid);
        drop(state);
        // Only re-root (and thus re-sweep) when a root already existed and
        // is changing. The very first `set_root` anchors a graph that may
        // still have objects pending a later `change` fragment to link them
        // in (add-then-link-later) — sweeping here would delete them before
        // they're ever reachable.
        if let Some(previous) = previous {
            if previous != root_uuid {
                self.recompute_reachability(root_uuid).await?;
            }
        }
        Ok(())
    }

    /// Read-only accessor; does not take the write lock (spec §4.3:
    /// "reads of the graph outside a mutation are allowed only through the
    /// provided `getByUUID` accessor").
    pub async fn get_by_uuid(&self, uuid: Uuid) -> Result<Option<crate::kernel::ModelObject>, ScopeError> {
        self.backend.get_model_object_by_uuid(uuid).await
    }

    pub fn subscribe(&self) -> ChangeReceiver {
        ChangeReceiver { rx: self.changes_tx.subscribe() }
    }

    /// Apply a batch of fragments atomically under the write lock (spec
    /// §4.3's five-step pipeline). Returns one outcome per input fragment,
    /// in input order.
    pub async fn apply_sync_fragments(
        &self,
        fragments: Vec<SyncFragment>,
        options: ApplyOptions,
    ) -> Result<Vec<FragmentOutcome>, ScopeError> {
        let mut guard = self.write_lock.lock().await;
        self.apply_locked(&mut guard, fragments, options).await
    }

    /// Acquire the write lock and hold it across a caller-supplied closure,
    /// for query operations (`jetstream-query`) that must walk keypaths
    /// against a consistent graph and then apply the resulting fragments
    /// without releasing the lock in between (SPEC_FULL §11, resolving the
    /// `PushQueryOperation` write-lock question in favor of the
    /// write-locked form).
    pub async fn with_write_lock<'a, F, Fut, T>(&'a self, f: F) -> T
    where
        F: FnOnce(ScopeCursor<'a>) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let guard = self.write_lock.lock().await;
        f(ScopeCursor { scope: self, guard }).await
    }

    async fn apply_locked(
        &self,
        guard: &mut ScopeState,
        fragments: Vec<SyncFragment>,
        options: ApplyOptions,
    ) -> Result<Vec<FragmentOutcome>, ScopeError> {
        // Step 2: verify. Schema/type-mismatch failures become per-fragment
        // errors; with `options.atomic` set the first failure aborts the
        // whole batch before anything is mutated.
        let mut verify_errors: Vec<Option<ScopeError>> = Vec::with_capacity(fragments.len());
        for frag in &fragments {
            let err = self.verify_fragment(frag).await;
            if options.atomic {
                if let Some(e) = err {
                    return Ok(fragments.iter().map(|_| FragmentOutcome::Error(e.to_string())).collect());
                }
            }
            verify_errors.push(err);
        }

        // Step 3: apply. Fragments that failed verification are skipped but
        // still occupy their slot in the result vector.
        let mut outcomes = Vec::with_capacity(fragments.len());
        let mut applied = Vec::with_capacity(fragments.len());
        for (frag, verify_err) in fragments.iter().zip(verify_errors.into_iter()) {
            if let Some(e) = verify_err {
                outcomes.push(FragmentOutcome::Error(e.to_string()));
                continue;
            }
            match self.apply_one(guard, frag).await {
                Ok(()) => {
                    outcomes.push(FragmentOutcome::Ok);
                    applied.push(frag.clone());
                }
                Err(e @ ScopeError::Backend(_)) => return Err(e),
                Err(e) => outcomes.push(FragmentOutcome::Error(e.to_string())),
            }
        }

        // Step 4: reachability pass.
        if let Some(root) = guard.root {
            self.recompute_reachability(root).await?;
        }

        // Step 5: emit, with the original options so the originator can be
        // filtered out by the session layer.
        if !applied.is_empty() {
            let _ = self.changes_tx.send(ChangeEvent { fragments: applied, options });
        }

        Ok(outcomes)
    }

    async fn verify_fragment(&self, frag: &SyncFragment) -> Option<ScopeError> {
        if let Err(e) = frag.validate(&self.registry) {
            return Some(e.into());
        }
        match frag.kind {
            FragmentKind::Change | FragmentKind::Remove | FragmentKind::Movechange => {
                match self.backend.contains_model_object_with_uuid(frag.uuid).await {
                    Ok(true) => None,
                    Ok(false) => Some(ScopeError::TargetMissing(frag.uuid)),
                    Err(e) => Some(e),
                }
            }
            FragmentKind::Add | FragmentKind::Root => None,
        }
    }

    async fn apply_one(&self, state: &mut ScopeState, frag: &SyncFragment) -> Result<(), ScopeError> {
        match frag.kind {
            FragmentKind::Add => self.apply_add(frag).await,
            FragmentKind::Change | FragmentKind::Movechange => self.apply_change(frag).await,
            FragmentKind::Remove => self.backend.remove_model_object(frag.uuid).await,
            FragmentKind::Root => {
                if !frag.properties.is_empty() {
                    self.apply_change(frag).await?;
                }
                state.root = Some(frag.uuid);
                Ok(())
            }
        }
    }

    async fn apply_add(&self, frag: &SyncFragment) -> Result<(), ScopeError> {
        self.registry
            .get(&frag.cls_name)
            .ok_or_else(|| ScopeError::Fragment(crate::error::FragmentError::UnknownType(frag.cls_name.clone())))?;
        let mut obj = crate::kernel::ModelObject::new(frag.uuid, frag.cls_name.clone());
        for (name, value) in &frag.properties {
            let descriptor = self
                .registry
                .property(&frag.cls_name, name)
                .ok_or_else(|| ScopeError::Fragment(crate::error::FragmentError::UnknownProperty(
                    name.clone(),
                    frag.cls_name.clone(),
                )))?;
            obj.set(name.clone(), property_value_from_json(&descriptor.kind, descriptor.collection, value)?);
        }
        self.backend.add_model_object(obj).await
    }

    async fn apply_change(&self, frag: &SyncFragment) -> Result<(), ScopeError> {
        let mut changed = HashMap::with_capacity(frag.properties.len());
        for (name, value) in &frag.properties {
            let descriptor = self
                .registry
                .property(&frag.cls_name, name)
                .ok_or_else(|| ScopeError::Fragment(crate::error::FragmentError::UnknownProperty(
                    name.clone(),
                    frag.cls_name.clone(),
                )))?;
            changed.insert(name.clone(), property_value_from_json(&descriptor.kind, descriptor.collection, value)?);
        }
        self.backend.update_model_object(frag.uuid, changed).await
    }

    /// BFS from `root` over every stored object's model-ref properties;
    /// anything not reached is detached (removed from the backend) per
    /// spec §4.3 step 4 / §4.1's `detached` transition. Objects that remain
    /// reachable are (re-)marked `Attached(root)`; objects that fall out of
    /// reach are marked `Detached` before they're pruned, so the §4.1 state
    /// machine is actually exercised rather than inferred from backend
    /// presence alone.
    async fn recompute_reachability(&self, root: Uuid) -> Result<(), ScopeError> {
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut queue = vec![root];
        visited.insert(root);
        while let Some(uuid) = queue.pop() {
            let Some(obj) = self.backend.get_model_object_by_uuid(uuid).await? else {
                continue;
            };
            for next in obj.outgoing_refs() {
                if visited.insert(next) {
                    queue.push(next);
                }
            }
        }
        for &uuid in &visited {
            self.backend.set_binding(uuid, crate::kernel::ScopeBinding::Attached(root)).await?;
        }
        for uuid in self.backend.all_uuids().await? {
            if !visited.contains(&uuid) {
                self.backend.set_binding(uuid, crate::kernel::ScopeBinding::Detached).await?;
                self.backend.remove_model_object(uuid).await?;
            }
        }
        Ok(())
    }
}

/// Convert a wire JSON value into a [`PropertyValue`] per the property's
/// declared kind (spec §4.2's validation rules, reapplied here since
/// `SyncFragment::validate` only checks shape, not the concrete stored
/// representation).
fn property_value_from_json(
    kind: &PropertyKind,
    collection: bool,
    value: &Value,
) -> Result<PropertyValue, ScopeError> {
    if collection {
        let items = value.as_array().ok_or_else(|| {
            ScopeError::Fragment(crate::error::FragmentError::ExpectedCollection {
                property: "<collection>".to_string(),
            })
        })?;
        if matches!(kind, PropertyKind::ModelRef(_)) {
            let uuids = items
                .iter()
                .map(|v| uuid_from_value(v))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(PropertyValue::ModelRefList(uuids))
        } else {
            Ok(PropertyValue::ScalarList(items.clone()))
        }
    } else if matches!(kind, PropertyKind::ModelRef(_)) {
        Ok(PropertyValue::ModelRef(uuid_from_value(value)?))
    } else {
        Ok(PropertyValue::Scalar(value.clone()))
    }
}

fn uuid_from_value(value: &Value) -> Result<Uuid, ScopeError> {
    value
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| {
            ScopeError::Fragment(crate::error::FragmentError::TypeMismatch {
                property: "<model-ref>".to_string(),
                expected_kind: "uuid string".to_string(),
            })
        })
}
