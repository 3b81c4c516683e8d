//! Mesh state, access specifications and health types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Running
//!    │                            │
//!    │ shutdown()                 │ shutdown()
//!    ↓                            ↓
//! Stopped ←──────────────── ShuttingDown
//! ```
//!
//! - **Created**: after `NetMeshBase::new()`. Local objects can be created,
//!   but the mesh is not reachable from other meshes yet.
//! - **Running**: registered in the network, housekeeping active.
//! - **ShuttingDown**: proxies are draining their endpoints.
//! - **Stopped**: unregistered. Safe to drop.

use crate::endpoint::EndpointPhase;
use crate::identifier::{NetworkIdentifier, ObjectIdentifier};
use crate::probe::coherence::CoherenceSpecification;

/// State of a mesh.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshState {
    /// Created but not yet reachable.
    ///
    /// Call [`start()`](super::NetMeshBase::start) to register the mesh.
    Created,

    /// Registered and serving.
    Running,

    /// Shutting down gracefully.
    ///
    /// Every proxy endpoint is draining its queued messages.
    ShuttingDown,

    /// Stopped.
    Stopped,
}

impl std::fmt::Display for MeshState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeshState::Created => write!(f, "Created"),
            MeshState::Running => write!(f, "Running"),
            MeshState::ShuttingDown => write!(f, "ShuttingDown"),
            MeshState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What to access on a remote mesh, and how.
///
/// # Example
///
/// ```rust
/// use mesh_replication::{AccessSpecification, CoherenceSpecification, NetworkIdentifier};
/// use std::time::Duration;
///
/// let remote = NetworkIdentifier::parse("http://feed.example/rss").unwrap();
/// let spec = AccessSpecification::to_home(remote)
///     .with_scope(1)
///     .with_coherence(CoherenceSpecification::Periodic { period: Duration::from_secs(60) });
/// assert_eq!(spec.scope, Some(1));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AccessSpecification {
    /// The mesh that owns the object.
    pub remote: NetworkIdentifier,
    /// The object; `None` = the remote mesh's home object.
    pub object: Option<ObjectIdentifier>,
    /// Also replicate neighbours up to this depth.
    pub scope: Option<u32>,
    /// Refresh policy if the remote turns out to be a harvested source.
    pub coherence: Option<CoherenceSpecification>,
}

impl AccessSpecification {
    /// Access the home object of `remote`.
    pub fn to_home(remote: NetworkIdentifier) -> Self {
        Self {
            remote,
            object: None,
            scope: None,
            coherence: None,
        }
    }

    /// Access one object on the mesh that owns it.
    pub fn to_object(identifier: ObjectIdentifier) -> Self {
        Self {
            remote: identifier.mesh().clone(),
            object: Some(identifier),
            scope: None,
            coherence: None,
        }
    }

    pub fn with_scope(mut self, depth: u32) -> Self {
        self.scope = Some(depth);
        self
    }

    pub fn with_coherence(mut self, coherence: CoherenceSpecification) -> Self {
        self.coherence = Some(coherence);
        self
    }

    /// The object this specification resolves to.
    pub fn target(&self) -> ObjectIdentifier {
        self.object
            .clone()
            .unwrap_or_else(|| self.remote.home_object())
    }
}

/// Health of one proxy.
#[derive(Debug, Clone)]
pub struct ProxyHealth {
    pub partner: NetworkIdentifier,
    pub phase: EndpointPhase,
    pub dead: bool,
    pub queued_messages: usize,
    pub fetches: u64,
    pub fetch_failures: u64,
    pub lock_requests: u64,
    pub lock_failures: u64,
}

/// Health snapshot of a mesh, for readiness / liveness endpoints.
///
/// Collected from in-memory state only; no messages are sent.
#[derive(Debug, Clone)]
pub struct MeshHealth {
    pub identifier: NetworkIdentifier,
    pub state: MeshState,
    /// Objects in the cache (owned and replicas).
    pub objects: usize,
    pub replicas: usize,
    /// Replicas whose lease has run out.
    pub stale_replicas: usize,
    pub proxies: Vec<ProxyHealth>,
    /// Running and no proxy endpoint is dead.
    pub healthy: bool,
}
