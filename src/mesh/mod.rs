// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The mesh base: a local object graph with replicas of remote objects.
//!
//! [`NetMeshBase`] ties together:
//! - The object cache (`ObjectIdentifier → ObjectCell`), shared by all proxies
//! - One [`Proxy`] per remote mesh it talks to, created lazily
//! - Replica housekeeping (purging copies whose lease ran out long ago)
//!
//! # Access
//!
//! ```text
//! access_locally(id) ──► cached & lease valid? ──yes──► copy
//!        │                        │ no (replica)
//!        │                        ▼
//!        │                 home proxy.fetch_object
//!        ▼ not cached, remote id
//! access_remote(spec) ──► obtain_proxy(remote) ──► fetch_object
//!                              │
//!                              └─ LocalNetwork: registered mesh, or a shadow
//!                                 created by the probe manager
//! ```
//!
//! # Writes
//!
//! `update_object` only succeeds while the local mesh holds the object's
//! lock. `write_with_lock` first honours lock requests other meshes left
//! waiting, then acquires the lock through the right proxy, then writes.

mod network;
mod types;

pub use network::{LocalNetwork, MeshContext, MeshResolver};
pub use types::{AccessSpecification, MeshHealth, MeshState, ProxyHealth};

use crate::clock::{millis_between, Clock, Timestamp, NEVER};
use crate::config::MeshConfig;
use crate::error::{AccessFailure, MeshError, Result};
use crate::identifier::{NetworkIdentifier, ObjectIdentifier};
use crate::metrics;
use crate::object::{GraphObject, ObjectCell};
use crate::probe::coherence::CoherenceSpecification;
use crate::proxy::Proxy;
use crate::wire::{ObjectSnapshot, ProxyMessage};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

/// Attempts `write_with_lock` makes when the lock moves away between
/// acquiring it and taking the write gate.
const WRITE_LOCK_ATTEMPTS: usize = 3;

const SHUTDOWN_TASK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

pub(crate) struct MeshInner {
    pub(crate) identifier: NetworkIdentifier,
    pub(crate) config: MeshConfig,
    clock: Clock,
    network: LocalNetwork,
    objects: DashMap<ObjectIdentifier, Arc<ObjectCell>>,
    proxies: DashMap<NetworkIdentifier, Arc<Proxy>>,
    read_only: bool,
    last_access: AtomicI64,
    generation: AtomicU64,
    state_tx: watch::Sender<MeshState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// A mesh: the local graph plus its proxies toward other meshes.
///
/// Cloning is cheap and yields another handle to the same mesh.
#[derive(Clone)]
pub struct NetMeshBase {
    inner: Arc<MeshInner>,
}

impl std::fmt::Debug for NetMeshBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetMeshBase")
            .field("identifier", &self.inner.identifier)
            .field("state", &self.state())
            .field("objects", &self.inner.objects.len())
            .field("proxies", &self.inner.proxies.len())
            .finish()
    }
}

impl NetMeshBase {
    /// Create a mesh with its home object. Call [`start()`](Self::start) to
    /// make it reachable.
    pub fn new(context: MeshContext) -> Result<Self> {
        Self::build(context, false)
    }

    /// A mesh whose objects other meshes may read but never lock.
    pub(crate) fn new_read_only(context: MeshContext) -> Result<Self> {
        Self::build(context, true)
    }

    fn build(context: MeshContext, read_only: bool) -> Result<Self> {
        context.config.validate()?;
        let identifier = context.config.identifier()?;
        let (state_tx, _) = watch::channel(MeshState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        let now = context.clock.now();

        let objects = DashMap::new();
        let home = identifier.home_object();
        objects.insert(
            home.clone(),
            Arc::new(ObjectCell::new(GraphObject::new_local(home, now))),
        );

        metrics::set_mesh_state(identifier.as_str(), "Created");
        Ok(Self {
            inner: Arc::new(MeshInner {
                identifier,
                config: context.config,
                clock: context.clock,
                network: context.network,
                objects,
                proxies: DashMap::new(),
                read_only,
                last_access: AtomicI64::new(now),
                generation: AtomicU64::new(0),
                state_tx,
                shutdown_tx,
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<MeshInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<MeshInner> {
        &self.inner
    }

    pub fn identifier(&self) -> &NetworkIdentifier {
        &self.inner.identifier
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.inner.network
    }

    pub fn state(&self) -> MeshState {
        *self.inner.state_tx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<MeshState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    /// When this mesh last served or answered an access.
    pub fn last_access(&self) -> Timestamp {
        self.inner.last_access.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self) {
        self.inner
            .last_access
            .fetch_max(self.inner.clock.now(), Ordering::Relaxed);
    }

    fn set_state(&self, state: MeshState) {
        let _ = self.inner.state_tx.send(state);
        metrics::set_mesh_state(self.inner.identifier.as_str(), &state.to_string());
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            MeshState::Running => Ok(()),
            MeshState::ShuttingDown | MeshState::Stopped => Err(MeshError::Shutdown),
            other => Err(MeshError::InvalidState {
                expected: "Running".to_string(),
                actual: other.to_string(),
            }),
        }
    }

    /// Register in the network and start housekeeping.
    pub async fn start(&self) -> Result<()> {
        if self.state() != MeshState::Created {
            return Err(MeshError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }
        let generation = self.inner.network.register(&self.inner)?;
        self.inner.generation.store(generation, Ordering::Relaxed);

        let lease = &self.inner.config.settings.lease;
        if !lease.housekeeping_disabled {
            let handle = spawn_housekeeping(
                Arc::downgrade(&self.inner),
                lease.housekeeping_interval(),
                self.inner.shutdown_tx.subscribe(),
            );
            if let Ok(mut tasks) = self.inner.tasks.lock() {
                tasks.push(handle);
            }
        }

        self.set_state(MeshState::Running);
        info!(mesh = %self.inner.identifier, generation, "Mesh running");
        Ok(())
    }

    // =========================================================================
    // Cache
    // =========================================================================

    pub(crate) fn cell(&self, identifier: &ObjectIdentifier) -> Option<Arc<ObjectCell>> {
        self.inner.objects.get(identifier).map(|c| Arc::clone(c.value()))
    }

    pub fn contains(&self, identifier: &ObjectIdentifier) -> bool {
        self.inner.objects.contains_key(identifier)
    }

    pub fn object_count(&self) -> usize {
        self.inner.objects.len()
    }

    /// Identifiers of every cached object, sorted.
    pub fn object_identifiers(&self) -> Vec<ObjectIdentifier> {
        let mut ids: Vec<_> = self.inner.objects.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Create an object owned by this mesh.
    pub async fn create_object(
        &self,
        local: &str,
        properties: BTreeMap<String, serde_json::Value>,
    ) -> Result<GraphObject> {
        if self.state() == MeshState::Stopped {
            return Err(MeshError::Shutdown);
        }
        let identifier = self.inner.identifier.object(local);
        let mut object = GraphObject::new_local(identifier.clone(), self.inner.clock.now());
        object.properties = properties;

        match self.inner.objects.entry(identifier.clone()) {
            Entry::Occupied(_) => Err(MeshError::InvalidState {
                expected: "unused identifier".to_string(),
                actual: format!("{} exists", identifier),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(ObjectCell::new(object.clone())));
                metrics::set_object_count(self.inner.identifier.as_str(), self.inner.objects.len());
                debug!(mesh = %self.inner.identifier, object = %identifier, "Object created");
                Ok(object)
            }
        }
    }

    /// Insert or update an object owned by this mesh, content only.
    ///
    /// Returns `true` if the object was new.
    pub(crate) async fn store_owned(
        &self,
        local: &str,
        properties: BTreeMap<String, serde_json::Value>,
        neighbors: Vec<ObjectIdentifier>,
    ) -> Result<bool> {
        let identifier = self.inner.identifier.object(local);
        let now = self.inner.clock.now();
        let (cell, created) = match self.inner.objects.entry(identifier.clone()) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(slot) => {
                let mut object = GraphObject::new_local(identifier, now);
                object.properties = properties.clone();
                object.neighbors = neighbors.clone();
                let cell = Arc::new(ObjectCell::new(object));
                slot.insert(Arc::clone(&cell));
                (cell, true)
            }
        };
        if !created {
            cell.modify(move |o| {
                o.properties = properties;
                o.neighbors = neighbors;
                o.time_updated = now;
            })
            .await?;
        }
        Ok(created)
    }

    /// Drop every proxy's per-object lock state for an object no longer cached.
    fn forget_lock_bookkeeping(&self, identifier: &ObjectIdentifier) {
        for proxy in self.proxies() {
            proxy.forget_object(identifier);
        }
    }

    /// Remove an object owned by this mesh and cancel every replica's lease.
    pub(crate) async fn remove_owned(&self, identifier: &ObjectIdentifier) -> bool {
        let Some((_, cell)) = self.inner.objects.remove(identifier) else {
            return false;
        };
        self.forget_lock_bookkeeping(identifier);
        let holders: Vec<NetworkIdentifier> = cell.read().await.replica_holders().cloned().collect();
        for holder in holders {
            self.send_to(
                &holder,
                ProxyMessage::CancelLease {
                    identifiers: vec![identifier.clone()],
                },
            )
            .await;
        }
        true
    }

    /// Merge a snapshot received through `partner` into the cache.
    ///
    /// Objects owned here are never overwritten by a copy; replicas whose
    /// lock is held here keep their content and only renew the lease.
    pub(crate) async fn merge_replica(
        &self,
        snapshot: &ObjectSnapshot,
        partner: &NetworkIdentifier,
    ) -> Result<Arc<ObjectCell>> {
        let identifier = &snapshot.identifier;
        if identifier.mesh() == &self.inner.identifier {
            return Err(MeshError::InvariantViolation(format!(
                "{} received a copy of its own object {}",
                self.inner.identifier, identifier
            )));
        }
        let now = self.inner.clock.now();
        let lease = self.inner.config.settings.lease.lease_duration();

        let (cell, created) = match self.inner.objects.entry(identifier.clone()) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(slot) => {
                let cell = Arc::new(ObjectCell::new(GraphObject::replica_from(
                    snapshot, partner, now, lease,
                )));
                slot.insert(Arc::clone(&cell));
                (cell, true)
            }
        };
        if created {
            metrics::set_object_count(self.inner.identifier.as_str(), self.inner.objects.len());
        } else {
            cell.modify(move |o| {
                o.add_proxy(partner);
                if o.holds_lock() {
                    o.renew_lease(now, lease);
                } else {
                    o.apply_snapshot(snapshot, now, lease);
                }
            })
            .await?;
        }
        Ok(cell)
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// Return an object by identifier.
    ///
    /// A replica whose lease ran out is refreshed through its home proxy; an
    /// uncached remote object is fetched from its owning mesh.
    #[instrument(skip(self), fields(mesh = %self.inner.identifier))]
    pub async fn access_locally(&self, identifier: &ObjectIdentifier) -> Result<GraphObject> {
        self.touch();
        if let Some(cell) = self.cell(identifier) {
            let object = cell.snapshot().await;
            if object.is_lease_valid(self.inner.clock.now()) {
                return Ok(object);
            }
            let home = object
                .home_proxy
                .clone()
                .ok_or_else(|| MeshError::Internal(format!("{} expired without home", identifier)))?;
            let proxy = self.obtain_proxy(&home).await?;
            return proxy
                .fetch_object(identifier, &AccessSpecification::to_object(identifier.clone()))
                .await;
        }
        if identifier.mesh() == &self.inner.identifier {
            return Err(MeshError::access(identifier, AccessFailure::NotFound));
        }
        self.access_remote(&AccessSpecification::to_object(identifier.clone()))
            .await
    }

    /// Access an object on a remote mesh as described by `spec`.
    #[instrument(skip(self, spec), fields(mesh = %self.inner.identifier, remote = %spec.remote))]
    pub async fn access_remote(&self, spec: &AccessSpecification) -> Result<GraphObject> {
        let target = spec.target();
        if spec.remote == self.inner.identifier {
            self.touch();
            return match self.cell(&target) {
                Some(cell) => Ok(cell.snapshot().await),
                None => Err(MeshError::access(&target, AccessFailure::NotFound)),
            };
        }
        let proxy = self
            .obtain_proxy_with(&spec.remote, spec.coherence.clone())
            .await?;
        proxy.fetch_object(&target, spec).await
    }

    /// The proxy toward `remote`, creating it (and its partner) if needed.
    pub async fn obtain_proxy(&self, remote: &NetworkIdentifier) -> Result<Arc<Proxy>> {
        self.obtain_proxy_with(remote, None).await
    }

    /// As [`obtain_proxy`](Self::obtain_proxy), with the coherence to use if
    /// `remote` turns out to be a harvested source.
    pub async fn obtain_proxy_with(
        &self,
        remote: &NetworkIdentifier,
        coherence: Option<CoherenceSpecification>,
    ) -> Result<Arc<Proxy>> {
        self.ensure_running()?;
        if remote == &self.inner.identifier {
            return Err(MeshError::Config(format!(
                "mesh {} cannot proxy to itself",
                remote
            )));
        }
        if let Some(proxy) = self.live_proxy(remote).await {
            return Ok(proxy);
        }
        let network = self.inner.network.clone();
        network.connect(self, remote, coherence).await
    }

    /// Existing proxy toward `remote`, live or not.
    pub fn proxy(&self, remote: &NetworkIdentifier) -> Option<Arc<Proxy>> {
        self.inner.proxies.get(remote).map(|p| Arc::clone(p.value()))
    }

    pub fn proxies(&self) -> Vec<Arc<Proxy>> {
        self.inner.proxies.iter().map(|p| Arc::clone(p.value())).collect()
    }

    /// The proxy toward `remote` if its endpoint is up and its partner is
    /// the registration it was created for.
    pub(crate) async fn live_proxy(&self, remote: &NetworkIdentifier) -> Option<Arc<Proxy>> {
        let proxy = self.proxy(remote)?;
        let current = self.inner.network.generation(remote);
        if current == Some(proxy.partner_generation()) && proxy.is_live().await {
            Some(proxy)
        } else {
            None
        }
    }

    pub(crate) async fn install_proxy(&self, proxy: Arc<Proxy>) {
        let partner = proxy.partner().clone();
        let replaced = self.inner.proxies.insert(partner, proxy);
        metrics::set_proxy_count(self.inner.identifier.as_str(), self.inner.proxies.len());
        if let Some(old) = replaced {
            debug!(mesh = %self.inner.identifier, partner = %old.partner(), "Replacing stale proxy");
            old.die().await;
        }
    }

    /// Drop the proxy toward `remote`, putting its endpoint to rest.
    pub(crate) async fn forget_proxy(&self, remote: &NetworkIdentifier) {
        if let Some((_, proxy)) = self.inner.proxies.remove(remote) {
            proxy.die().await;
            metrics::set_proxy_count(self.inner.identifier.as_str(), self.inner.proxies.len());
        }
    }

    async fn send_to(&self, remote: &NetworkIdentifier, message: ProxyMessage) {
        let Some(proxy) = self.proxy(remote) else {
            debug!(mesh = %self.inner.identifier, partner = %remote, kind = message.kind(), "No proxy, message dropped");
            return;
        };
        if let Err(e) = proxy.send(&message).await {
            debug!(mesh = %self.inner.identifier, partner = %remote, error = %e, "Message not sent");
        }
    }

    // =========================================================================
    // Writes and locks
    // =========================================================================

    /// Mutate an object whose lock this mesh holds.
    ///
    /// Fails with [`MeshError::NotLockOwner`] before anything is sent if
    /// another mesh holds the lock.
    pub async fn update_object<F>(&self, identifier: &ObjectIdentifier, f: F) -> Result<GraphObject>
    where
        F: FnOnce(&mut GraphObject) + Send,
    {
        let cell = self
            .cell(identifier)
            .ok_or_else(|| MeshError::access(identifier, AccessFailure::NotFound))?;
        let gate = cell.gate().await;
        let updated = self.write_locked(identifier, &cell, f).await;
        drop(gate);
        let updated = updated?;
        self.after_exclusive(identifier, &cell).await;
        Ok(updated)
    }

    async fn write_locked<F>(&self, identifier: &ObjectIdentifier, cell: &ObjectCell, f: F) -> Result<GraphObject>
    where
        F: FnOnce(&mut GraphObject) + Send,
    {
        if let Some(lock_proxy) = cell.read().await.lock_proxy.clone() {
            return Err(MeshError::NotLockOwner {
                identifier: identifier.clone(),
                lock_proxy,
            });
        }
        let now = self.inner.clock.now();
        cell.modify(move |o| {
            f(o);
            o.time_updated = now;
            o.clone()
        })
        .await
    }

    /// Acquire the lock if needed, then mutate the object.
    ///
    /// Lock requests from other meshes that were waiting on this object are
    /// honoured first.
    pub async fn write_with_lock<F>(&self, identifier: &ObjectIdentifier, f: F) -> Result<GraphObject>
    where
        F: FnOnce(&mut GraphObject) + Send,
    {
        let mut f = Some(f);
        let mut last_holder = None;
        for _ in 0..WRITE_LOCK_ATTEMPTS {
            let cell = match self.cell(identifier) {
                Some(cell) => cell,
                None => {
                    self.access_locally(identifier).await?;
                    self.cell(identifier)
                        .ok_or_else(|| MeshError::access(identifier, AccessFailure::NotFound))?
                }
            };
            self.honour_lock_requests(identifier, &cell).await;
            if !cell.read().await.holds_lock() {
                self.request_lock(identifier).await?;
            }

            let gate = cell.gate().await;
            let holder = cell.read().await.lock_proxy.clone();
            if holder.is_some() {
                last_holder = holder;
                drop(gate);
                continue;
            }
            let Some(f) = f.take() else {
                break;
            };
            let updated = self.write_locked(identifier, &cell, f).await;
            drop(gate);
            let updated = updated?;
            self.after_exclusive(identifier, &cell).await;
            return Ok(updated);
        }
        Err(MeshError::NotLockOwner {
            identifier: identifier.clone(),
            lock_proxy: last_holder.unwrap_or_else(|| self.inner.identifier.clone()),
        })
    }

    /// Obtain the write lock through the proxy toward its current holder.
    pub async fn request_lock(&self, identifier: &ObjectIdentifier) -> Result<()> {
        let cell = self
            .cell(identifier)
            .ok_or_else(|| MeshError::access(identifier, AccessFailure::NotFound))?;
        let target = {
            let o = cell.read().await;
            if o.holds_lock() {
                return Ok(());
            }
            o.lock_proxy.clone().or_else(|| o.home_proxy.clone())
        };
        let Some(target) = target else {
            return Ok(());
        };
        let proxy = self.obtain_proxy(&target).await?;
        proxy.request_lock(identifier).await
    }

    /// Give the lock on a replica back to its home mesh.
    pub async fn release_lock(&self, identifier: &ObjectIdentifier) -> Result<()> {
        let Some(cell) = self.cell(identifier) else {
            return Ok(());
        };
        let home = {
            let o = cell.read().await;
            if !o.holds_lock() {
                return Ok(());
            }
            o.home_proxy.clone()
        };
        let Some(home) = home else {
            // Owned here; there is nobody to give it back to.
            return Ok(());
        };
        let proxy = self.obtain_proxy(&home).await?;
        proxy.release_lock(identifier).await
    }

    /// Serve lock requests that waited for a local write, or give a
    /// reclaimed lock back home.
    async fn honour_lock_requests(&self, identifier: &ObjectIdentifier, cell: &Arc<ObjectCell>) {
        while let Some(request) = cell.take_deferred() {
            let Some(proxy) = self.proxy(&request.partner) else {
                continue;
            };
            let _write = cell.gate().await;
            if let Err(e) = proxy.grant_lock(cell, request.request_id).await {
                warn!(mesh = %self.inner.identifier, object = %identifier, error = %e, "Deferred grant failed");
            }
        }

        let release_to = {
            let o = cell.read().await;
            if o.holds_lock() && o.give_up_lock && o.is_replica() {
                o.home_proxy.clone()
            } else {
                None
            }
        };
        if let Some(home) = release_to.and_then(|h| self.proxy(&h)) {
            // Spawned: this may run on a delivery callback, which must not
            // wait for its own endpoint's response.
            let identifier = identifier.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = home.release_lock(&identifier).await {
                        debug!(object = %identifier, error = %e, "Giving lock back failed");
                    }
                }
                .instrument(info_span!("give_up_lock")),
            );
        }
    }

    /// Follow-up after an exclusive operation on an object ended.
    pub(crate) async fn after_exclusive(&self, identifier: &ObjectIdentifier, cell: &Arc<ObjectCell>) {
        self.honour_lock_requests(identifier, cell).await;
        self.notify_replicas(identifier, cell).await;
    }

    /// Push the current content of an owned object to every replica holder.
    pub(crate) async fn notify_replicas(&self, identifier: &ObjectIdentifier, cell: &ObjectCell) {
        let (snapshot, holders) = {
            let o = cell.read().await;
            if o.is_replica() || !o.holds_lock() {
                return;
            }
            let holders: Vec<NetworkIdentifier> = o.replica_holders().cloned().collect();
            (o.to_snapshot(), holders)
        };
        for holder in holders {
            self.send_to(
                &holder,
                ProxyMessage::PushChange {
                    snapshot: snapshot.clone(),
                    lock_reclaimed: false,
                },
            )
            .await;
        }
        debug!(mesh = %self.inner.identifier, object = %identifier, "Replicas notified");
    }

    /// Ask the replica holding the lock to give it back.
    pub(crate) async fn reclaim_lock(&self, identifier: &ObjectIdentifier, holder: &NetworkIdentifier) {
        let Some(cell) = self.cell(identifier) else {
            return;
        };
        let snapshot = cell.read().await.to_snapshot();
        self.send_to(
            holder,
            ProxyMessage::PushChange {
                snapshot,
                lock_reclaimed: true,
            },
        )
        .await;
    }

    /// Delete an object.
    ///
    /// Owned objects need the lock and cancel every replica's lease; for a
    /// replica, the home mesh is told to forget this copy.
    pub async fn delete_object(&self, identifier: &ObjectIdentifier) -> Result<()> {
        if identifier.is_home() && identifier.mesh() == &self.inner.identifier {
            return Err(MeshError::InvariantViolation(format!(
                "home object of {} cannot be deleted",
                self.inner.identifier
            )));
        }
        let cell = self
            .cell(identifier)
            .ok_or_else(|| MeshError::access(identifier, AccessFailure::NotFound))?;
        let (replica, lock_proxy, home) = {
            let o = cell.read().await;
            (o.is_replica(), o.lock_proxy.clone(), o.home_proxy.clone())
        };

        if !replica {
            if let Some(lock_proxy) = lock_proxy {
                return Err(MeshError::NotLockOwner {
                    identifier: identifier.clone(),
                    lock_proxy,
                });
            }
            let _write = cell.gate().await;
            self.remove_owned(identifier).await;
        } else {
            if lock_proxy.is_none() {
                self.release_lock(identifier).await?;
            }
            self.inner.objects.remove(identifier);
            self.forget_lock_bookkeeping(identifier);
            if let Some(home) = home {
                self.send_to(
                    &home,
                    ProxyMessage::CancelLease {
                        identifiers: vec![identifier.clone()],
                    },
                )
                .await;
            }
        }
        metrics::set_object_count(self.inner.identifier.as_str(), self.inner.objects.len());
        info!(mesh = %self.inner.identifier, object = %identifier, "Object deleted");
        Ok(())
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    /// Drop replicas whose lease ended at least `replica_purge_after` ago,
    /// telling their home meshes. Replicas whose lock is held here are kept.
    ///
    /// Returns the number of replicas dropped.
    pub async fn purge_expired_replicas(&self) -> usize {
        let now = self.inner.clock.now();
        let purge_after = self.inner.config.settings.lease.replica_purge_after();
        let purge_after_ms = u64::try_from(purge_after.as_millis()).unwrap_or(u64::MAX);

        let cells: Vec<(ObjectIdentifier, Arc<ObjectCell>)> = self
            .inner
            .objects
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut by_home: HashMap<NetworkIdentifier, Vec<ObjectIdentifier>> = HashMap::new();
        for (identifier, cell) in cells {
            let home = {
                let o = cell.read().await;
                let expired_long_ago = o.time_expires == NEVER
                    || millis_between(o.time_expires, now) >= purge_after_ms;
                if !o.is_replica() || o.holds_lock() || o.is_lease_valid(now) || !expired_long_ago {
                    continue;
                }
                o.home_proxy.clone()
            };
            let removed = self
                .inner
                .objects
                .remove_if(&identifier, |_, c| Arc::ptr_eq(c, &cell))
                .is_some();
            if removed {
                self.forget_lock_bookkeeping(&identifier);
            }
            if let (true, Some(home)) = (removed, home) {
                by_home.entry(home).or_default().push(identifier);
            }
        }

        let purged: usize = by_home.values().map(Vec::len).sum();
        for (home, identifiers) in by_home {
            self.send_to(&home, ProxyMessage::CancelLease { identifiers }).await;
        }
        if purged > 0 {
            info!(mesh = %self.inner.identifier, purged, "Expired replicas purged");
            metrics::record_replicas_purged(self.inner.identifier.as_str(), purged);
            metrics::set_object_count(self.inner.identifier.as_str(), self.inner.objects.len());
        }
        purged
    }

    /// Health snapshot for monitoring. Sends nothing.
    pub async fn health_check(&self) -> MeshHealth {
        let state = self.state();
        let now = self.inner.clock.now();

        let cells: Vec<Arc<ObjectCell>> = self.inner.objects.iter().map(|e| Arc::clone(e.value())).collect();
        let mut replicas = 0;
        let mut stale_replicas = 0;
        for cell in &cells {
            let o = cell.read().await;
            if o.is_replica() {
                replicas += 1;
                if !o.is_lease_valid(now) {
                    stale_replicas += 1;
                }
            }
        }

        let mut proxies = Vec::new();
        for proxy in self.proxies() {
            let endpoint = proxy.endpoint();
            let stats = proxy.stats();
            proxies.push(ProxyHealth {
                partner: proxy.partner().clone(),
                phase: endpoint.phase().await,
                dead: endpoint.is_dead().await,
                queued_messages: endpoint.messages_to_be_sent().await.len(),
                fetches: stats.fetches,
                fetch_failures: stats.fetch_failures,
                lock_requests: stats.lock_requests,
                lock_failures: stats.lock_failures,
            });
        }

        let healthy = state == MeshState::Running && proxies.iter().all(|p| !p.dead);
        MeshHealth {
            identifier: self.inner.identifier.clone(),
            state,
            objects: cells.len(),
            replicas,
            stale_replicas,
            proxies,
            healthy,
        }
    }

    /// Put every proxy into graceful shutdown, let endpoints drain, and
    /// leave the network.
    pub async fn shutdown(&self) {
        if matches!(self.state(), MeshState::ShuttingDown | MeshState::Stopped) {
            return;
        }
        info!(mesh = %self.inner.identifier, "Shutting down mesh");
        self.set_state(MeshState::ShuttingDown);
        let _ = self.inner.shutdown_tx.send(true);

        let proxies = self.proxies();
        for proxy in &proxies {
            proxy.die().await;
        }
        let drain = self.inner.config.settings.endpoint.delta_recover();
        for proxy in &proxies {
            if !proxy.wait_drained(drain).await {
                warn!(mesh = %self.inner.identifier, partner = %proxy.partner(), "Endpoint did not drain in time");
            }
        }
        for proxy in &proxies {
            self.inner.proxies.remove(proxy.partner());
            if let Some(partner) = self.inner.network.lookup(proxy.partner()) {
                partner.forget_proxy(&self.inner.identifier).await;
            }
        }
        metrics::set_proxy_count(self.inner.identifier.as_str(), 0);

        let generation = self.inner.generation.load(Ordering::Relaxed);
        if generation > 0 {
            self.inner.network.unregister(&self.inner.identifier, generation);
        }

        let handles: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_TASK_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(mesh = %self.inner.identifier, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(mesh = %self.inner.identifier, "Task did not stop in time");
                }
            }
        }

        self.set_state(MeshState::Stopped);
        info!(mesh = %self.inner.identifier, "Mesh stopped");
    }
}

fn spawn_housekeeping(
    mesh: std::sync::Weak<MeshInner>,
    interval: std::time::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let span = info_span!("housekeeping");
    tokio::spawn(
        async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Housekeeping stopping");
                            break;
                        }
                    }

                    _ = timer.tick() => {
                        let Some(inner) = mesh.upgrade() else {
                            break;
                        };
                        NetMeshBase::from_inner(inner).purge_expired_replicas().await;
                    }
                }
            }
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn started(ctx: &MeshContext, id: &str) -> NetMeshBase {
        let mesh = NetMeshBase::new(ctx.sibling(id)).unwrap();
        mesh.start().await.unwrap();
        mesh
    }

    fn props(key: &str, value: serde_json::Value) -> BTreeMap<String, serde_json::Value> {
        let mut map = BTreeMap::new();
        map.insert(key.to_string(), value);
        map
    }

    #[tokio::test]
    async fn test_new_mesh_has_home_object() {
        let mesh = NetMeshBase::new(MeshContext::for_testing("http://a.example/")).unwrap();
        assert_eq!(mesh.state(), MeshState::Created);
        let home = mesh.identifier().home_object();
        assert!(mesh.contains(&home));
        assert!(mesh.access_locally(&home).await.unwrap().holds_lock());
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let mesh = NetMeshBase::new(MeshContext::for_testing("http://a.example/")).unwrap();
        mesh.start().await.unwrap();
        assert!(matches!(mesh.start().await, Err(MeshError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_create_duplicate_rejected() {
        let mesh = NetMeshBase::new(MeshContext::for_testing("http://a.example/")).unwrap();
        mesh.create_object("x", BTreeMap::new()).await.unwrap();
        assert!(mesh.create_object("x", BTreeMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_local_object_is_not_found() {
        let mesh = NetMeshBase::new(MeshContext::for_testing("http://a.example/")).unwrap();
        let err = mesh
            .access_locally(&mesh.identifier().object("nope"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MeshError::ObjectAccess {
                reason: AccessFailure::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_proxy_to_self_rejected() {
        let mesh = NetMeshBase::new(MeshContext::for_testing("http://a.example/")).unwrap();
        mesh.start().await.unwrap();
        let own = mesh.identifier().clone();
        assert!(matches!(mesh.obtain_proxy(&own).await, Err(MeshError::Config(_))));
    }

    #[tokio::test]
    async fn test_obtain_proxy_requires_running() {
        let mesh = NetMeshBase::new(MeshContext::for_testing("http://a.example/")).unwrap();
        let other = NetworkIdentifier::parse("http://b.example/").unwrap();
        assert!(matches!(
            mesh.obtain_proxy(&other).await,
            Err(MeshError::InvalidState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_remote_and_reuse_proxy() {
        let ctx = MeshContext::for_testing("http://a.example/");
        let a = started(&ctx, "http://a.example/").await;
        let b = started(&ctx, "http://b.example/").await;
        b.create_object("doc", props("title", json!("hello"))).await.unwrap();

        let spec = AccessSpecification::to_object(b.identifier().object("doc"));
        let replica = a.access_remote(&spec).await.unwrap();
        assert_eq!(replica.properties["title"], json!("hello"));
        assert!(replica.is_replica());

        let p1 = a.obtain_proxy(b.identifier()).await.unwrap();
        let p2 = a.obtain_proxy(b.identifier()).await.unwrap();
        assert!(Arc::ptr_eq(&p1, &p2));
        assert!(b.proxy(a.identifier()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scope_replicates_neighbours() {
        let ctx = MeshContext::for_testing("http://a.example/");
        let a = started(&ctx, "http://a.example/").await;
        let b = started(&ctx, "http://b.example/").await;
        b.create_object("leaf", BTreeMap::new()).await.unwrap();
        let root = b.identifier().object("root");
        b.create_object("root", BTreeMap::new()).await.unwrap();
        let leaf = b.identifier().object("leaf");
        let leaf_for_update = leaf.clone();
        b.update_object(&root, move |o| o.neighbors.push(leaf_for_update))
            .await
            .unwrap();

        a.access_remote(&AccessSpecification::to_object(root).with_scope(1))
            .await
            .unwrap();
        assert!(a.contains(&leaf));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_replica_without_lock_rejected() {
        let ctx = MeshContext::for_testing("http://a.example/");
        let a = started(&ctx, "http://a.example/").await;
        let b = started(&ctx, "http://b.example/").await;
        b.create_object("doc", BTreeMap::new()).await.unwrap();
        let id = b.identifier().object("doc");
        a.access_locally(&id).await.unwrap();

        let err = a
            .update_object(&id, |o| {
                o.properties.insert("k".into(), json!(1));
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::NotLockOwner { .. }));
        assert!(a.access_locally(&id).await.unwrap().properties.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_with_lock_moves_lock_and_release_returns_content() {
        let ctx = MeshContext::for_testing("http://a.example/");
        let a = started(&ctx, "http://a.example/").await;
        let b = started(&ctx, "http://b.example/").await;
        b.create_object("doc", BTreeMap::new()).await.unwrap();
        let id = b.identifier().object("doc");

        let written = a
            .write_with_lock(&id, |o| {
                o.properties.insert("by".into(), json!("a"));
            })
            .await
            .unwrap();
        assert!(written.holds_lock());
        assert!(!b.access_locally(&id).await.unwrap().holds_lock());

        a.release_lock(&id).await.unwrap();
        let at_b = b.access_locally(&id).await.unwrap();
        assert!(at_b.holds_lock());
        assert_eq!(at_b.properties["by"], json!("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_update_pushes_to_replicas() {
        let ctx = MeshContext::for_testing("http://a.example/");
        let a = started(&ctx, "http://a.example/").await;
        let b = started(&ctx, "http://b.example/").await;
        b.create_object("doc", props("v", json!(1))).await.unwrap();
        let id = b.identifier().object("doc");
        a.access_locally(&id).await.unwrap();

        b.update_object(&id, |o| {
            o.properties.insert("v".into(), json!(2));
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let cached = a.cell(&id).unwrap().snapshot().await;
        assert_eq!(cached.properties["v"], json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_replicas_cancels_lease_at_home() {
        let mut config = MeshConfig::for_testing("http://a.example/");
        config.settings.lease.lease_duration = "1s".to_string();
        config.settings.lease.replica_purge_after = "1s".to_string();
        let ctx = MeshContext::new(config);
        let a = started(&ctx, "http://a.example/").await;
        let b = started(&ctx, "http://b.example/").await;
        b.create_object("doc", BTreeMap::new()).await.unwrap();
        let id = b.identifier().object("doc");
        a.access_locally(&id).await.unwrap();
        assert_eq!(a.purge_expired_replicas().await, 0);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(a.purge_expired_replicas().await, 1);
        assert!(!a.contains(&id));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let owned = b.access_locally(&id).await.unwrap();
        assert!(!owned.proxies.contains(a.identifier()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_owned_object_expires_replicas() {
        let ctx = MeshContext::for_testing("http://a.example/");
        let a = started(&ctx, "http://a.example/").await;
        let b = started(&ctx, "http://b.example/").await;
        b.create_object("doc", BTreeMap::new()).await.unwrap();
        let id = b.identifier().object("doc");
        a.access_locally(&id).await.unwrap();

        b.delete_object(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!a.cell(&id).unwrap().snapshot().await.is_lease_valid(a.clock().now()));

        let err = a.access_locally(&id).await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::ObjectAccess {
                reason: AccessFailure::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_home_object_cannot_be_deleted() {
        let mesh = NetMeshBase::new(MeshContext::for_testing("http://a.example/")).unwrap();
        let home = mesh.identifier().home_object();
        assert!(matches!(
            mesh.delete_object(&home).await,
            Err(MeshError::InvariantViolation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_and_shutdown() {
        let ctx = MeshContext::for_testing("http://a.example/");
        let a = started(&ctx, "http://a.example/").await;
        let b = started(&ctx, "http://b.example/").await;
        a.obtain_proxy(b.identifier()).await.unwrap();

        let health = a.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.proxies.len(), 1);
        assert_eq!(health.objects, 1);

        a.shutdown().await;
        assert_eq!(a.state(), MeshState::Stopped);
        assert!(a.proxies().is_empty());
        assert!(b.proxy(a.identifier()).is_none());
        assert!(ctx.network.lookup(a.identifier()).is_none());
    }
}
