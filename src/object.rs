//! Graph objects and their lease / lock metadata.
//!
//! # Lease
//!
//! A replica (an object with a `home_proxy`) may be used without a round
//! trip while `now < time_expires`. Objects owned by the local mesh never
//! expire.
//!
//! # Lock
//!
//! `lock_proxy == None` means the local mesh holds the exclusive write lock.
//! Otherwise it names the proxy leading toward the holder, and that proxy must
//! be one of `proxies`. `give_up_lock` is a cooperative request from another
//! mesh; the holder releases at its next opportunity and is never overridden.
//!
//! # Concurrency
//!
//! Each object lives in an [`ObjectCell`]: a read/write lock around the
//! metadata plus a write gate held for the duration of an exclusive local
//! operation. Lock requests that arrive while the gate is held are deferred
//! on the cell and served as soon as the gate is released.

use crate::clock::{add_duration, Timestamp, NEVER};
use crate::error::{MeshError, Result};
use crate::identifier::{NetworkIdentifier, ObjectIdentifier};
use crate::wire::{ObjectSnapshot, ProxyReference};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, RwLock};

/// A node of the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphObject {
    pub identifier: ObjectIdentifier,
    pub time_created: Timestamp,
    pub time_updated: Timestamp,
    pub time_read: Timestamp,
    pub time_expires: Timestamp,
    /// Every proxy through which a copy of this object is known, in order.
    pub proxies: Vec<NetworkIdentifier>,
    /// Proxy toward the mesh where the object was created.
    pub home_proxy: Option<NetworkIdentifier>,
    /// Proxy toward the lock holder; `None` = held locally.
    pub lock_proxy: Option<NetworkIdentifier>,
    pub give_up_lock: bool,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub neighbors: Vec<ObjectIdentifier>,
}

impl GraphObject {
    /// A fresh object owned by the local mesh.
    pub fn new_local(identifier: ObjectIdentifier, now: Timestamp) -> Self {
        Self {
            identifier,
            time_created: now,
            time_updated: now,
            time_read: NEVER,
            time_expires: NEVER,
            proxies: Vec::new(),
            home_proxy: None,
            lock_proxy: None,
            give_up_lock: false,
            properties: BTreeMap::new(),
            neighbors: Vec::new(),
        }
    }

    /// Materialize a replica from a snapshot received through `partner`.
    pub fn replica_from(
        snapshot: &ObjectSnapshot,
        partner: &NetworkIdentifier,
        now: Timestamp,
        lease: Duration,
    ) -> Self {
        let mut object = Self {
            identifier: snapshot.identifier.clone(),
            time_created: snapshot.time_created,
            time_updated: snapshot.time_updated,
            time_read: NEVER,
            time_expires: NEVER,
            proxies: vec![partner.clone()],
            home_proxy: Some(partner.clone()),
            lock_proxy: Some(partner.clone()),
            give_up_lock: false,
            properties: BTreeMap::new(),
            neighbors: Vec::new(),
        };
        object.apply_snapshot(snapshot, now, lease);
        object
    }

    /// Take over content from a snapshot and renew the lease.
    ///
    /// Lock and proxy bookkeeping are left alone.
    pub fn apply_snapshot(&mut self, snapshot: &ObjectSnapshot, now: Timestamp, lease: Duration) {
        self.time_created = snapshot.time_created;
        self.apply_content(snapshot);
        self.renew_lease(now, lease);
    }

    /// Take over what a writer may change: properties, neighbours and the
    /// update time.
    pub fn apply_content(&mut self, snapshot: &ObjectSnapshot) {
        self.time_updated = snapshot.time_updated;
        self.properties = snapshot.properties.clone();
        self.neighbors = snapshot.neighbors.clone();
    }

    /// Record a read at `now`; the copy is trusted until `now + lease`.
    pub fn renew_lease(&mut self, now: Timestamp, lease: Duration) {
        self.time_read = now;
        self.time_expires = add_duration(now, lease);
    }

    /// Whether the object is a replica of an object owned elsewhere.
    pub fn is_replica(&self) -> bool {
        self.home_proxy.is_some()
    }

    /// Whether the local copy may be used at `now` without a refresh.
    pub fn is_lease_valid(&self, now: Timestamp) -> bool {
        if !self.is_replica() {
            return true;
        }
        self.time_expires != NEVER && now < self.time_expires
    }

    /// Whether the local mesh holds the write lock.
    pub fn holds_lock(&self) -> bool {
        self.lock_proxy.is_none()
    }

    /// Add a proxy reference, keeping order and uniqueness.
    pub fn add_proxy(&mut self, proxy: &NetworkIdentifier) {
        if !self.proxies.contains(proxy) {
            self.proxies.push(proxy.clone());
        }
    }

    /// Forget a proxy. A lock held through it comes back to this mesh.
    pub fn remove_proxy(&mut self, proxy: &NetworkIdentifier) {
        self.proxies.retain(|p| p != proxy);
        if self.lock_proxy.as_ref() == Some(proxy) {
            self.lock_proxy = None;
        }
    }

    /// Replicas held elsewhere, i.e. proxies other than the one toward home.
    pub fn replica_holders(&self) -> impl Iterator<Item = &NetworkIdentifier> {
        self.proxies
            .iter()
            .filter(move |p| Some(*p) != self.home_proxy.as_ref())
    }

    pub fn check_invariants(&self) -> Result<()> {
        if let Some(lock) = &self.lock_proxy {
            if !self.proxies.contains(lock) {
                return Err(MeshError::InvariantViolation(format!(
                    "{}: lock proxy {} is not among its proxies",
                    self.identifier, lock
                )));
            }
        }
        if let Some(home) = &self.home_proxy {
            if !self.proxies.contains(home) {
                return Err(MeshError::InvariantViolation(format!(
                    "{}: home proxy {} is not among its proxies",
                    self.identifier, home
                )));
            }
        }
        Ok(())
    }

    /// Snapshot as this mesh sees the object.
    pub fn to_snapshot(&self) -> ObjectSnapshot {
        ObjectSnapshot {
            identifier: self.identifier.clone(),
            time_created: self.time_created,
            time_updated: self.time_updated,
            time_read: self.time_read,
            time_expires: self.time_expires,
            give_up_lock: self.give_up_lock,
            proxies: self
                .proxies
                .iter()
                .map(|p| ProxyReference {
                    identifier: p.clone(),
                    towards_home: self.home_proxy.as_ref() == Some(p),
                    towards_lock: self.lock_proxy.as_ref() == Some(p),
                })
                .collect(),
            properties: self.properties.clone(),
            neighbors: self.neighbors.clone(),
        }
    }
}

/// A lock request from another mesh waiting for the local write gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredLockRequest {
    pub partner: NetworkIdentifier,
    pub request_id: u64,
}

/// Shared, per-object slot in a mesh's cache.
#[derive(Debug)]
pub struct ObjectCell {
    object: RwLock<GraphObject>,
    write_gate: Mutex<()>,
    deferred: std::sync::Mutex<VecDeque<DeferredLockRequest>>,
}

impl ObjectCell {
    pub fn new(object: GraphObject) -> Self {
        Self {
            object: RwLock::new(object),
            write_gate: Mutex::new(()),
            deferred: std::sync::Mutex::new(VecDeque::new()),
        }
    }

    /// Copy of the current metadata and content.
    pub async fn snapshot(&self) -> GraphObject {
        self.object.read().await.clone()
    }

    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, GraphObject> {
        self.object.read().await
    }

    /// Mutate under the object's lock. The invariants are re-checked and the
    /// change is rolled back if they break.
    pub async fn modify<R>(&self, f: impl FnOnce(&mut GraphObject) -> R) -> Result<R> {
        let mut guard = self.object.write().await;
        let before = guard.clone();
        let result = f(&mut guard);
        if let Err(e) = guard.check_invariants() {
            *guard = before;
            return Err(e);
        }
        Ok(result)
    }

    /// Wait for the exclusive write gate.
    pub async fn gate(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock().await
    }

    /// Whether a local exclusive operation is in progress.
    pub fn is_gated(&self) -> bool {
        self.write_gate.try_lock().is_err()
    }

    pub fn defer_lock_request(&self, request: DeferredLockRequest) {
        if let Ok(mut queue) = self.deferred.lock() {
            if !queue.contains(&request) {
                queue.push_back(request);
            }
        }
    }

    pub fn take_deferred(&self) -> Option<DeferredLockRequest> {
        self.deferred.lock().ok().and_then(|mut q| q.pop_front())
    }

    pub fn has_deferred(&self) -> bool {
        self.deferred.lock().map(|q| !q.is_empty()).unwrap_or(false)
    }
}
