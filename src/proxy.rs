// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Proxy: the local handle on one remote mesh.
//!
//! A proxy owns one ping-pong endpoint whose partner is the matching proxy
//! inside the remote mesh. It turns object operations into
//! [`ProxyMessage`]s and applies what comes back to the local cache.
//!
//! # Per-object state
//!
//! ```text
//! cache:  Uncached ──fetch──► Fresh ──lease runs out──► Stale
//!                               ▲                         │ fetch
//!                               └────── Refreshing ◄──────┘
//!
//! lock:   LockedRemote ──request──► LockRequested ──grant──► LockedLocal
//!              ▲                                                 │ release
//!              └───────────────── LockReleasing ◄────────────────┘
//! ```
//!
//! # Lock transfer
//!
//! Locks move only between an object's home mesh and one replica holder.
//! The side giving the lock away points `lock_proxy` at the receiver before
//! the message leaves, and the receiver clears `lock_proxy` when the message
//! arrives, so at no instant do two meshes both hold it. A request that
//! reaches the home while a replica holds the lock is denied, and the holder
//! is asked (`give_up_lock`) to return it at its next opportunity.
//!
//! # Delivery
//!
//! The endpoint calls back on its actor task, one batch at a time.
//! Responses, pushes and releases are applied inline, keeping their order.
//! Serving a fetch or a lock request is spawned, since it may wait on
//! object gates.

use crate::clock::NEVER;
use crate::endpoint::{BoxFuture, EndpointListener, EndpointPhase, PingPongEndpoint};
use crate::error::{AccessFailure, MeshError, Result};
use crate::identifier::{NetworkIdentifier, ObjectIdentifier};
use crate::mesh::{AccessSpecification, MeshInner, NetMeshBase};
use crate::metrics;
use crate::object::{DeferredLockRequest, GraphObject, ObjectCell};
use crate::wire::{decode_message, encode_message, ObjectSnapshot, ProxyMessage};
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Cache state of one object, from a proxy's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Uncached,
    Fresh,
    Stale,
    Refreshing,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheState::Uncached => write!(f, "Uncached"),
            CacheState::Fresh => write!(f, "Fresh"),
            CacheState::Stale => write!(f, "Stale"),
            CacheState::Refreshing => write!(f, "Refreshing"),
        }
    }
}

/// Lock state of one object, from a proxy's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    LockedRemote,
    LockRequested,
    LockedLocal,
    LockReleasing,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::LockedRemote => write!(f, "LockedRemote"),
            LockState::LockRequested => write!(f, "LockRequested"),
            LockState::LockedLocal => write!(f, "LockedLocal"),
            LockState::LockReleasing => write!(f, "LockReleasing"),
        }
    }
}

/// Counters for one proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStats {
    pub fetches: u64,
    pub cache_hits: u64,
    pub fetch_failures: u64,
    pub lock_requests: u64,
    pub lock_failures: u64,
    pub malformed_messages: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    fetches: AtomicU64,
    cache_hits: AtomicU64,
    fetch_failures: AtomicU64,
    lock_requests: AtomicU64,
    lock_failures: AtomicU64,
    malformed_messages: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProxyStats {
        ProxyStats {
            fetches: self.fetches.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            lock_requests: self.lock_requests.load(Ordering::Relaxed),
            lock_failures: self.lock_failures.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
        }
    }
}

/// Hands endpoint deliveries to the proxy without owning it.
struct ProxyListener {
    proxy: Weak<Proxy>,
}

impl EndpointListener<Vec<u8>> for ProxyListener {
    fn messages_received(&self, token: i64, messages: Vec<Vec<u8>>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some(proxy) = self.proxy.upgrade() else {
                return;
            };
            trace!(partner = %proxy.partner, token, count = messages.len(), "Delivering batch");
            for bytes in messages {
                proxy.handle_incoming(&bytes).await;
            }
        })
    }

    fn send_failed(&self, token: i64) {
        if let Some(proxy) = self.proxy.upgrade() {
            debug!(partner = %proxy.partner, token, "Partner unreachable, endpoint will resend");
        }
    }
}

/// Marks an object as being refreshed for as long as it lives.
struct RefreshGuard<'a> {
    refreshing: &'a DashMap<ObjectIdentifier, usize>,
    identifier: ObjectIdentifier,
}

impl<'a> RefreshGuard<'a> {
    fn new(refreshing: &'a DashMap<ObjectIdentifier, usize>, identifier: &ObjectIdentifier) -> Self {
        *refreshing.entry(identifier.clone()).or_insert(0) += 1;
        Self {
            refreshing,
            identifier: identifier.clone(),
        }
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.refreshing.get_mut(&self.identifier) {
            *count = count.saturating_sub(1);
        }
        self.refreshing.remove_if(&self.identifier, |_, count| *count == 0);
    }
}

/// Local representative of the relationship with one remote mesh.
pub struct Proxy {
    local: NetworkIdentifier,
    partner: NetworkIdentifier,
    partner_generation: u64,
    mesh: Weak<MeshInner>,
    endpoint: PingPongEndpoint<Vec<u8>>,
    next_request_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<ProxyMessage>>,
    lock_gates: DashMap<ObjectIdentifier, Arc<Mutex<()>>>,
    lock_states: DashMap<ObjectIdentifier, LockState>,
    refreshing: DashMap<ObjectIdentifier, usize>,
    stats: StatsCounters,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("local", &self.local)
            .field("partner", &self.partner)
            .field("partner_generation", &self.partner_generation)
            .finish()
    }
}

impl Proxy {
    /// Create an unconnected proxy inside `mesh` toward `partner`.
    pub(crate) fn new(
        mesh: &Arc<MeshInner>,
        partner: NetworkIdentifier,
        partner_generation: u64,
    ) -> Arc<Self> {
        let local = mesh.identifier.clone();
        let config = mesh.config.settings.endpoint.clone();
        let name = format!("{}->{}", local, partner);
        Arc::new_cyclic(|weak| {
            let listener = Arc::new(ProxyListener {
                proxy: weak.clone(),
            });
            Self {
                local,
                partner,
                partner_generation,
                mesh: Arc::downgrade(mesh),
                endpoint: PingPongEndpoint::new(name, config, listener),
                next_request_id: AtomicU64::new(1),
                pending: DashMap::new(),
                lock_gates: DashMap::new(),
                lock_states: DashMap::new(),
                refreshing: DashMap::new(),
                stats: StatsCounters::default(),
            }
        })
    }

    /// The remote mesh this proxy talks to.
    pub fn partner(&self) -> &NetworkIdentifier {
        &self.partner
    }

    /// Registration generation of the partner when this proxy was created.
    pub fn partner_generation(&self) -> u64 {
        self.partner_generation
    }

    pub fn endpoint(&self) -> &PingPongEndpoint<Vec<u8>> {
        &self.endpoint
    }

    pub fn stats(&self) -> ProxyStats {
        self.stats.snapshot()
    }

    /// Whether the endpoint still accepts messages.
    pub async fn is_live(&self) -> bool {
        !self.endpoint.is_dying().await
    }

    pub async fn phase(&self) -> EndpointPhase {
        self.endpoint.phase().await
    }

    fn mesh(&self) -> Result<NetMeshBase> {
        self.mesh
            .upgrade()
            .map(NetMeshBase::from_inner)
            .ok_or(MeshError::Shutdown)
    }

    fn request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lock_gate(&self, identifier: &ObjectIdentifier) -> Arc<Mutex<()>> {
        self.lock_gates
            .entry(identifier.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the gate of `identifier` unless another caller holds or waits on it.
    fn retire_gate(&self, identifier: &ObjectIdentifier, gate: &Arc<Mutex<()>>) {
        // One reference lives in the map, one with the caller.
        self.lock_gates
            .remove_if(identifier, |_, g| Arc::ptr_eq(g, gate) && Arc::strong_count(g) <= 2);
    }

    /// Forget lock bookkeeping for an object that left the local cache.
    pub(crate) fn forget_object(&self, identifier: &ObjectIdentifier) {
        self.lock_states.remove(identifier);
        self.lock_gates
            .remove_if(identifier, |_, g| Arc::strong_count(g) == 1);
    }

    /// Number of objects with lock bookkeeping on this proxy.
    pub(crate) fn tracked_lock_objects(&self) -> usize {
        self.lock_gates.len().max(self.lock_states.len())
    }

    /// Encode and queue one message for the partner.
    pub(crate) async fn send(&self, message: &ProxyMessage) -> Result<()> {
        let bytes = encode_message(message)?;
        trace!(partner = %self.partner, kind = message.kind(), "Queueing message");
        self.endpoint.enqueue_message_for_send(bytes).await
    }

    /// Send a request and wait for the response carrying the same id.
    ///
    /// `Ok(None)` means no response within `wait`.
    async fn round_trip(
        &self,
        request_id: u64,
        message: ProxyMessage,
        wait: Duration,
    ) -> Result<Option<ProxyMessage>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        if let Err(e) = self.send(&message).await {
            self.pending.remove(&request_id);
            return Err(e);
        }
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(response)) => Ok(Some(response)),
            _ => {
                self.pending.remove(&request_id);
                Ok(None)
            }
        }
    }

    fn complete(&self, request_id: u64, response: ProxyMessage) {
        match self.pending.remove(&request_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(response);
            }
            None => {
                debug!(
                    partner = %self.partner,
                    request_id,
                    kind = response.kind(),
                    "Response arrived after its waiter gave up"
                );
            }
        }
    }

    // =========================================================================
    // Requester side
    // =========================================================================

    /// Return the object, from cache while its lease holds, otherwise from
    /// the partner.
    ///
    /// Retries per the mesh's fetch retry schedule. On failure the cached
    /// copy, if any, is left as it was.
    pub async fn fetch_object(
        &self,
        identifier: &ObjectIdentifier,
        spec: &AccessSpecification,
    ) -> Result<GraphObject> {
        let mesh = self.mesh()?;
        if let Some(cell) = mesh.cell(identifier) {
            let object = cell.snapshot().await;
            if object.is_lease_valid(mesh.clock().now()) {
                StatsCounters::bump(&self.stats.cache_hits);
                metrics::record_fetch(self.partner.as_str(), "cached");
                return Ok(object);
            }
        }

        StatsCounters::bump(&self.stats.fetches);
        let _refreshing = RefreshGuard::new(&self.refreshing, identifier);
        let retry = mesh.config().settings.lease.fetch_retry();
        let started = Instant::now();

        for attempt in 1..=retry.max_attempts {
            let request_id = self.request_id();
            let request = ProxyMessage::FetchRequest {
                request_id,
                identifiers: vec![identifier.clone()],
                scope: spec.scope,
            };
            match self.round_trip(request_id, request, retry.connection_timeout).await {
                Ok(Some(ProxyMessage::FetchResponse { missing, .. })) => {
                    metrics::record_fetch_latency(self.partner.as_str(), started.elapsed());
                    if missing.contains(identifier) {
                        StatsCounters::bump(&self.stats.fetch_failures);
                        metrics::record_fetch(self.partner.as_str(), "not_found");
                        return Err(MeshError::access(identifier, AccessFailure::NotFound));
                    }
                    // The delivery handler already merged the snapshots.
                    return match mesh.cell(identifier) {
                        Some(cell) => {
                            metrics::record_fetch(self.partner.as_str(), "fetched");
                            Ok(cell.snapshot().await)
                        }
                        None => Err(MeshError::access(
                            identifier,
                            AccessFailure::Rejected("response did not carry the object".to_string()),
                        )),
                    };
                }
                Ok(Some(other)) => {
                    StatsCounters::bump(&self.stats.fetch_failures);
                    return Err(MeshError::access(
                        identifier,
                        AccessFailure::Rejected(format!("unexpected {}", other.kind())),
                    ));
                }
                Ok(None) => {
                    debug!(
                        partner = %self.partner,
                        object = %identifier,
                        attempt,
                        "Fetch timed out"
                    );
                }
                Err(e) => {
                    debug!(partner = %self.partner, object = %identifier, error = %e, "Fetch not sent");
                    StatsCounters::bump(&self.stats.fetch_failures);
                    metrics::record_fetch(self.partner.as_str(), "unreachable");
                    return Err(MeshError::access(
                        identifier,
                        AccessFailure::Unreachable { attempts: attempt },
                    ));
                }
            }
            if attempt < retry.max_attempts {
                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
            }
        }

        StatsCounters::bump(&self.stats.fetch_failures);
        metrics::record_fetch(self.partner.as_str(), "unreachable");
        warn!(
            partner = %self.partner,
            object = %identifier,
            attempts = retry.max_attempts,
            "Fetch failed, partner unreachable"
        );
        Err(MeshError::access(
            identifier,
            AccessFailure::Unreachable {
                attempts: retry.max_attempts,
            },
        ))
    }

    /// Obtain the exclusive write lock for `identifier` from the partner.
    ///
    /// Concurrent callers for the same object are served one at a time. A
    /// no-op if the lock is already local.
    pub async fn request_lock(&self, identifier: &ObjectIdentifier) -> Result<()> {
        let mesh = self.mesh()?;
        let gate = self.lock_gate(identifier);
        let result = {
            let _serial = gate.lock().await;
            let result = self.request_lock_serialized(&mesh, identifier).await;
            self.lock_states.remove(identifier);
            result
        };
        self.retire_gate(identifier, &gate);
        result
    }

    async fn request_lock_serialized(&self, mesh: &NetMeshBase, identifier: &ObjectIdentifier) -> Result<()> {
        let cell = match mesh.cell(identifier) {
            Some(cell) => cell,
            None => {
                self.fetch_object(identifier, &AccessSpecification::to_object(identifier.clone()))
                    .await?;
                mesh.cell(identifier)
                    .ok_or_else(|| MeshError::access(identifier, AccessFailure::NotFound))?
            }
        };
        if cell.read().await.holds_lock() {
            return Ok(());
        }

        StatsCounters::bump(&self.stats.lock_requests);
        self.lock_states.insert(identifier.clone(), LockState::LockRequested);
        let wait = mesh.config().settings.lease.lock_timeout();
        let request_id = self.request_id();
        let request = ProxyMessage::LockRequest {
            request_id,
            identifier: identifier.clone(),
        };

        let outcome = self.round_trip(request_id, request, wait).await;
        // A grant is applied by the delivery handler, even a late one, so the
        // object itself says who holds the lock now.
        let holds = cell.read().await.holds_lock();

        match outcome {
            Ok(Some(ProxyMessage::LockGranted { .. })) => {
                metrics::record_lock_event(self.partner.as_str(), "granted");
                info!(partner = %self.partner, object = %identifier, "Lock acquired");
                Ok(())
            }
            Ok(Some(ProxyMessage::LockDenied { reason, .. })) => {
                StatsCounters::bump(&self.stats.lock_failures);
                metrics::record_lock_event(self.partner.as_str(), "denied");
                debug!(partner = %self.partner, object = %identifier, %reason, "Lock denied");
                Err(MeshError::LockDenied {
                    identifier: identifier.clone(),
                    reason,
                })
            }
            Ok(Some(other)) => {
                StatsCounters::bump(&self.stats.lock_failures);
                Err(MeshError::access(
                    identifier,
                    AccessFailure::Rejected(format!("unexpected {}", other.kind())),
                ))
            }
            Ok(None) if holds => Ok(()),
            Ok(None) => {
                StatsCounters::bump(&self.stats.lock_failures);
                metrics::record_lock_event(self.partner.as_str(), "timeout");
                warn!(partner = %self.partner, object = %identifier, ?wait, "Lock request timed out");
                Err(MeshError::LockTimeout {
                    identifier: identifier.clone(),
                    waited: wait,
                })
            }
            Err(e) => {
                StatsCounters::bump(&self.stats.lock_failures);
                Err(e)
            }
        }
    }

    /// Give the write lock back to the partner, with the content written
    /// while holding it.
    ///
    /// Waits for any local exclusive operation on the object to finish. The
    /// lock leaves this mesh before the message is sent, so a lost
    /// acknowledgment (`LockTimeout`) does not leave two holders.
    pub async fn release_lock(&self, identifier: &ObjectIdentifier) -> Result<()> {
        let mesh = self.mesh()?;
        let gate = self.lock_gate(identifier);
        let result = {
            let _serial = gate.lock().await;
            let result = self.release_lock_serialized(&mesh, identifier).await;
            self.lock_states.remove(identifier);
            result
        };
        self.retire_gate(identifier, &gate);
        result
    }

    async fn release_lock_serialized(&self, mesh: &NetMeshBase, identifier: &ObjectIdentifier) -> Result<()> {
        let Some(cell) = mesh.cell(identifier) else {
            return Ok(());
        };
        let snapshot = {
            let _write = cell.gate().await;
            let partner = self.partner.clone();
            cell.modify(move |o| {
                if !o.holds_lock() {
                    return None;
                }
                o.add_proxy(&partner);
                o.lock_proxy = Some(partner);
                o.give_up_lock = false;
                Some(o.to_snapshot())
            })
            .await?
        };
        let Some(snapshot) = snapshot else {
            return Ok(());
        };

        self.lock_states
            .insert(identifier.clone(), LockState::LockReleasing);
        let wait = mesh.config().settings.lease.lock_timeout();
        let request_id = self.request_id();
        let outcome = self
            .round_trip(
                request_id,
                ProxyMessage::LockReleased {
                    request_id,
                    snapshot,
                },
                wait,
            )
            .await;

        match outcome {
            Ok(Some(_)) => {
                metrics::record_lock_event(self.partner.as_str(), "released");
                info!(partner = %self.partner, object = %identifier, "Lock released");
                Ok(())
            }
            Ok(None) => {
                warn!(
                    partner = %self.partner,
                    object = %identifier,
                    "No acknowledgment for lock release"
                );
                Err(MeshError::LockTimeout {
                    identifier: identifier.clone(),
                    waited: wait,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Cache state of `identifier` as seen through this proxy.
    pub async fn cache_state(&self, identifier: &ObjectIdentifier) -> CacheState {
        if self.refreshing.contains_key(identifier) {
            return CacheState::Refreshing;
        }
        let Ok(mesh) = self.mesh() else {
            return CacheState::Uncached;
        };
        match mesh.cell(identifier) {
            None => CacheState::Uncached,
            Some(cell) => {
                if cell.read().await.is_lease_valid(mesh.clock().now()) {
                    CacheState::Fresh
                } else {
                    CacheState::Stale
                }
            }
        }
    }

    /// Lock state of `identifier` as seen through this proxy.
    pub async fn lock_state(&self, identifier: &ObjectIdentifier) -> LockState {
        if let Some(state) = self.lock_states.get(identifier) {
            if matches!(*state, LockState::LockRequested | LockState::LockReleasing) {
                return *state;
            }
        }
        let holds = match self.mesh().ok().and_then(|m| m.cell(identifier)) {
            Some(cell) => cell.read().await.holds_lock(),
            None => false,
        };
        if holds {
            LockState::LockedLocal
        } else {
            LockState::LockedRemote
        }
    }

    /// Start draining the endpoint. Replies already in flight may still land.
    pub async fn initiate_cease_communications(&self) {
        info!(mesh = %self.local, partner = %self.partner, "Proxy ceasing communications");
        self.endpoint.graceful_die().await;
    }

    /// Cease communications and fail pending waiters.
    pub async fn die(&self) {
        self.initiate_cease_communications().await;
        self.pending.clear();
    }

    /// Wait until the endpoint has drained, or `limit` has passed.
    pub async fn wait_drained(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        let poll = Duration::from_millis(5).min(limit);
        loop {
            if self.endpoint.is_dead().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    async fn handle_incoming(self: &Arc<Self>, bytes: &[u8]) {
        let message = match decode_message(bytes) {
            Ok(message) => message,
            Err(e) => {
                StatsCounters::bump(&self.stats.malformed_messages);
                metrics::record_malformed_message(self.partner.as_str());
                warn!(partner = %self.partner, error = %e, "Dropping malformed message");
                return;
            }
        };
        trace!(partner = %self.partner, kind = message.kind(), "Message received");

        match message {
            ProxyMessage::FetchRequest {
                request_id,
                identifiers,
                scope,
            } => {
                let proxy = Arc::clone(self);
                let span = info_span!("serve_fetch", partner = %self.partner, request_id);
                tokio::spawn(
                    async move { proxy.serve_fetch(request_id, identifiers, scope).await }
                        .instrument(span),
                );
            }
            ProxyMessage::LockRequest {
                request_id,
                identifier,
            } => {
                let proxy = Arc::clone(self);
                let span = info_span!("serve_lock", partner = %self.partner, request_id);
                tokio::spawn(
                    async move { proxy.serve_lock_request(request_id, identifier).await }
                        .instrument(span),
                );
            }
            ProxyMessage::FetchResponse {
                request_id,
                snapshots,
                missing,
            } => {
                for snapshot in &snapshots {
                    self.merge(snapshot).await;
                }
                self.complete(
                    request_id,
                    ProxyMessage::FetchResponse {
                        request_id,
                        snapshots,
                        missing,
                    },
                );
            }
            ProxyMessage::LockGranted {
                request_id,
                snapshot,
            } => {
                self.accept_grant(&snapshot).await;
                self.complete(
                    request_id,
                    ProxyMessage::LockGranted {
                        request_id,
                        snapshot,
                    },
                );
            }
            response @ ProxyMessage::LockDenied { request_id, .. } => {
                self.complete(request_id, response);
            }
            response @ ProxyMessage::LockReleaseAck { request_id, .. } => {
                self.complete(request_id, response);
            }
            ProxyMessage::LockReleased {
                request_id,
                snapshot,
            } => {
                self.accept_release(request_id, &snapshot).await;
            }
            ProxyMessage::PushChange {
                snapshot,
                lock_reclaimed,
            } => {
                self.accept_push(&snapshot, lock_reclaimed).await;
            }
            ProxyMessage::CancelLease { identifiers } => {
                self.accept_cancel(&identifiers).await;
            }
        }
    }

    async fn merge(&self, snapshot: &ObjectSnapshot) {
        let Ok(mesh) = self.mesh() else {
            return;
        };
        if let Err(e) = mesh.merge_replica(snapshot, &self.partner).await {
            warn!(partner = %self.partner, object = %snapshot.identifier, error = %e, "Snapshot not merged");
        }
    }

    async fn accept_grant(&self, snapshot: &ObjectSnapshot) {
        let Ok(mesh) = self.mesh() else {
            return;
        };
        let cell = match mesh.cell(&snapshot.identifier) {
            Some(cell) => cell,
            None => match mesh.merge_replica(snapshot, &self.partner).await {
                Ok(cell) => cell,
                Err(e) => {
                    warn!(partner = %self.partner, error = %e, "Lock grant for unusable object");
                    return;
                }
            },
        };
        let now = mesh.clock().now();
        let lease = mesh.config().settings.lease.lease_duration();
        let partner = self.partner.clone();
        let result = cell
            .modify(move |o| {
                o.add_proxy(&partner);
                if o.is_replica() {
                    o.apply_snapshot(snapshot, now, lease);
                } else {
                    o.apply_content(snapshot);
                }
                o.lock_proxy = None;
                o.give_up_lock = false;
            })
            .await;
        if let Err(e) = result {
            warn!(partner = %self.partner, error = %e, "Lock grant not applied");
        }
    }

    async fn accept_release(&self, request_id: u64, snapshot: &ObjectSnapshot) {
        let Ok(mesh) = self.mesh() else {
            return;
        };
        let identifier = snapshot.identifier.clone();
        if let Some(cell) = mesh.cell(&identifier) {
            let now = mesh.clock().now();
            let lease = mesh.config().settings.lease.lease_duration();
            let partner = self.partner.clone();
            let accepted = cell
                .modify(move |o| {
                    if o.lock_proxy.as_ref() != Some(&partner) {
                        return false;
                    }
                    if o.is_replica() {
                        o.apply_snapshot(snapshot, now, lease);
                    } else {
                        o.apply_content(snapshot);
                    }
                    o.lock_proxy = None;
                    o.give_up_lock = false;
                    true
                })
                .await
                .unwrap_or(false);
            if accepted {
                debug!(partner = %self.partner, object = %identifier, "Lock returned");
                mesh.after_exclusive(&identifier, &cell).await;
            } else {
                warn!(partner = %self.partner, object = %identifier, "Release from a mesh not holding the lock");
            }
        }
        let ack = ProxyMessage::LockReleaseAck {
            request_id,
            identifier,
        };
        if let Err(e) = self.send(&ack).await {
            debug!(partner = %self.partner, error = %e, "Release acknowledgment not sent");
        }
    }

    async fn accept_push(self: &Arc<Self>, snapshot: &ObjectSnapshot, lock_reclaimed: bool) {
        let Ok(mesh) = self.mesh() else {
            return;
        };
        let identifier = snapshot.identifier.clone();
        let Some(cell) = mesh.cell(&identifier) else {
            // We dropped the replica; tell the sender to forget us.
            let cancel = ProxyMessage::CancelLease {
                identifiers: vec![identifier],
            };
            if let Err(e) = self.send(&cancel).await {
                debug!(partner = %self.partner, error = %e, "Lease cancel not sent");
            }
            return;
        };

        let now = mesh.clock().now();
        let lease = mesh.config().settings.lease.lease_duration();
        let must_release = cell
            .modify(move |o| {
                if o.is_replica() && !o.holds_lock() {
                    o.apply_snapshot(snapshot, now, lease);
                }
                if lock_reclaimed && o.holds_lock() && o.is_replica() {
                    o.give_up_lock = true;
                }
                o.holds_lock() && o.give_up_lock
            })
            .await
            .unwrap_or(false);

        if must_release && !cell.is_gated() {
            let proxy = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = proxy.release_lock(&identifier).await {
                    debug!(partner = %proxy.partner, object = %identifier, error = %e, "Reclaimed lock release failed");
                }
            });
        }
    }

    async fn accept_cancel(&self, identifiers: &[ObjectIdentifier]) {
        let Ok(mesh) = self.mesh() else {
            return;
        };
        for identifier in identifiers {
            let Some(cell) = mesh.cell(identifier) else {
                continue;
            };
            let partner = self.partner.clone();
            let result = cell
                .modify(move |o| {
                    if o.home_proxy.as_ref() == Some(&partner) {
                        // The home no longer serves it: the copy must not be trusted.
                        o.time_expires = NEVER;
                    } else {
                        o.remove_proxy(&partner);
                    }
                })
                .await;
            if let Err(e) = result {
                warn!(partner = %self.partner, object = %identifier, error = %e, "Lease cancel not applied");
            }
        }
        debug!(partner = %self.partner, count = identifiers.len(), "Leases cancelled");
    }

    // =========================================================================
    // Responder side
    // =========================================================================

    async fn serve_fetch(&self, request_id: u64, identifiers: Vec<ObjectIdentifier>, scope: Option<u32>) {
        let Ok(mesh) = self.mesh() else {
            return;
        };
        mesh.touch();

        let mut snapshots = Vec::new();
        let mut missing = Vec::new();
        let mut seen: HashSet<ObjectIdentifier> = HashSet::new();
        let mut queue: VecDeque<(ObjectIdentifier, u32)> =
            identifiers.iter().cloned().map(|id| (id, 0)).collect();
        let depth_limit = scope.unwrap_or(0);
        let requested: HashSet<ObjectIdentifier> = identifiers.into_iter().collect();

        while let Some((identifier, depth)) = queue.pop_front() {
            if !seen.insert(identifier.clone()) {
                continue;
            }
            let Some(cell) = mesh.cell(&identifier) else {
                if requested.contains(&identifier) {
                    missing.push(identifier);
                }
                continue;
            };
            let partner = self.partner.clone();
            let served = cell
                .modify(move |o| {
                    o.add_proxy(&partner);
                    o.to_snapshot()
                })
                .await;
            match served {
                Ok(snapshot) => {
                    if depth < depth_limit {
                        for neighbor in &snapshot.neighbors {
                            queue.push_back((neighbor.clone(), depth + 1));
                        }
                    }
                    snapshots.push(snapshot);
                }
                Err(e) => warn!(object = %identifier, error = %e, "Object not served"),
            }
        }

        debug!(
            partner = %self.partner,
            served = snapshots.len(),
            missing = missing.len(),
            "Fetch served"
        );
        let response = ProxyMessage::FetchResponse {
            request_id,
            snapshots,
            missing,
        };
        if let Err(e) = self.send(&response).await {
            debug!(partner = %self.partner, error = %e, "Fetch response not sent");
        }
    }

    async fn serve_lock_request(&self, request_id: u64, identifier: ObjectIdentifier) {
        let Ok(mesh) = self.mesh() else {
            return;
        };
        mesh.touch();

        let Some(cell) = mesh.cell(&identifier) else {
            self.deny(request_id, identifier, "unknown object".to_string()).await;
            return;
        };
        if mesh.is_read_only() {
            let reason = format!("objects of {} are read-only", mesh.identifier());
            self.deny(request_id, identifier, reason).await;
            return;
        }

        let (holder, home) = {
            let o = cell.read().await;
            (o.lock_proxy.clone(), o.home_proxy.clone())
        };
        match holder {
            Some(holder) if holder == self.partner => {
                // Our books already say they hold it: repeat the grant.
                if let Err(e) = self.grant_lock(&cell, request_id).await {
                    warn!(object = %identifier, error = %e, "Repeated grant failed");
                }
                return;
            }
            Some(holder) => {
                mesh.reclaim_lock(&identifier, &holder).await;
                let reason = format!("lock held via {}, asked to give it up", holder);
                self.deny(request_id, identifier, reason).await;
                return;
            }
            None => {}
        }
        if let Some(home) = home {
            if home != self.partner {
                let reason = format!("ask the home mesh {}", home);
                self.deny(request_id, identifier, reason).await;
                return;
            }
        }

        if cell.is_gated() {
            if let Err(e) = cell.modify(|o| o.give_up_lock = true).await {
                warn!(object = %identifier, error = %e, "Marking lock for give-up failed");
            }
            cell.defer_lock_request(DeferredLockRequest {
                partner: self.partner.clone(),
                request_id,
            });
            debug!(partner = %self.partner, object = %identifier, "Lock request deferred until local write completes");
            return;
        }

        {
            let _write = cell.gate().await;
            if let Err(e) = self.grant_lock(&cell, request_id).await {
                warn!(object = %identifier, error = %e, "Lock grant failed");
            }
        }
        // Requests deferred while the gate was held get their answer now.
        mesh.after_exclusive(&identifier, &cell).await;
    }

    /// Hand the lock to the partner. The caller holds the object's gate.
    pub(crate) async fn grant_lock(&self, cell: &ObjectCell, request_id: u64) -> Result<()> {
        let partner = self.partner.clone();
        let granted = cell
            .modify(move |o| {
                if !o.holds_lock() && o.lock_proxy.as_ref() != Some(&partner) {
                    o.give_up_lock = false;
                    return Err((o.identifier.clone(), o.lock_proxy.clone(), o.is_replica()));
                }
                o.add_proxy(&partner);
                o.lock_proxy = Some(partner);
                o.give_up_lock = false;
                Ok(o.to_snapshot())
            })
            .await?;

        match granted {
            Ok(snapshot) => {
                let identifier = snapshot.identifier.clone();
                metrics::record_lock_event(self.partner.as_str(), "served");
                info!(partner = %self.partner, object = %identifier, "Lock granted");
                self.send(&ProxyMessage::LockGranted {
                    request_id,
                    snapshot,
                })
                .await
            }
            Err((identifier, holder, replica)) => {
                // The home takes the lock back so the retry can succeed.
                if let (Some(holder), false, Ok(mesh)) = (holder, replica, self.mesh()) {
                    mesh.reclaim_lock(&identifier, &holder).await;
                }
                self.deny(request_id, identifier, "lock moved elsewhere".to_string())
                    .await;
                Ok(())
            }
        }
    }

    async fn deny(&self, request_id: u64, identifier: ObjectIdentifier, reason: String) {
        debug!(partner = %self.partner, object = %identifier, %reason, "Denying lock");
        let message = ProxyMessage::LockDenied {
            request_id,
            identifier,
            reason,
        };
        if let Err(e) = self.send(&message).await {
            debug!(partner = %self.partner, error = %e, "Lock denial not sent");
        }
    }
}
