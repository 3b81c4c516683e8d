//! In-process network of meshes.
//!
//! [`LocalNetwork`] maps each [`NetworkIdentifier`] to a running mesh. It only
//! holds weak references, so dropping a mesh removes it from the network.
//! Every registration gets a fresh generation number; proxies remember the
//! generation of their partner and are replaced when it changes.
//!
//! Identifiers with no registered mesh can be resolved by a
//! [`MeshResolver`] (the probe manager), which creates a shadow mesh on
//! demand.
//!
//! [`MeshContext`] bundles what a mesh needs from its surroundings: config,
//! clock and network. There are no process-wide singletons.

use super::{MeshInner, NetMeshBase};
use crate::clock::Clock;
use crate::config::MeshConfig;
use crate::endpoint::{connect_pair, BoxFuture};
use crate::error::{AccessFailure, MeshError, Result};
use crate::identifier::NetworkIdentifier;
use crate::probe::coherence::CoherenceSpecification;
use crate::proxy::Proxy;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Creates meshes for identifiers nobody registered.
pub trait MeshResolver: Send + Sync + 'static {
    /// Return a running mesh for `identifier`, or `None` if this resolver
    /// does not handle it.
    fn resolve(
        &self,
        identifier: &NetworkIdentifier,
        coherence: Option<CoherenceSpecification>,
    ) -> BoxFuture<'_, Result<Option<NetMeshBase>>>;
}

struct Registration {
    mesh: Weak<MeshInner>,
    generation: u64,
}

struct NetworkInner {
    meshes: DashMap<NetworkIdentifier, Registration>,
    next_generation: AtomicU64,
    resolver: RwLock<Option<Weak<dyn MeshResolver>>>,
    connect_lock: Mutex<()>,
}

/// Registry of the meshes in this process.
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("meshes", &self.inner.meshes.len())
            .finish()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                meshes: DashMap::new(),
                next_generation: AtomicU64::new(1),
                resolver: RwLock::new(None),
                connect_lock: Mutex::new(()),
            }),
        }
    }

    /// Install the fallback resolver. Held weakly.
    pub fn set_resolver(&self, resolver: Weak<dyn MeshResolver>) {
        if let Ok(mut slot) = self.inner.resolver.write() {
            *slot = Some(resolver);
        }
    }

    pub(crate) fn register(&self, mesh: &Arc<MeshInner>) -> Result<u64> {
        let identifier = mesh.identifier.clone();
        if let Some(existing) = self.inner.meshes.get(&identifier) {
            if existing.mesh.strong_count() > 0 {
                return Err(MeshError::Config(format!(
                    "mesh {} is already registered",
                    identifier
                )));
            }
        }
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        self.inner.meshes.insert(
            identifier.clone(),
            Registration {
                mesh: Arc::downgrade(mesh),
                generation,
            },
        );
        debug!(mesh = %identifier, generation, "Mesh registered");
        Ok(generation)
    }

    pub(crate) fn unregister(&self, identifier: &NetworkIdentifier, generation: u64) {
        self.inner
            .meshes
            .remove_if(identifier, |_, r| r.generation == generation);
        debug!(mesh = %identifier, generation, "Mesh unregistered");
    }

    /// Generation of the live registration for `identifier`.
    pub fn generation(&self, identifier: &NetworkIdentifier) -> Option<u64> {
        self.inner
            .meshes
            .get(identifier)
            .filter(|r| r.mesh.strong_count() > 0)
            .map(|r| r.generation)
    }

    /// The registered mesh, if it is still alive.
    pub fn lookup(&self, identifier: &NetworkIdentifier) -> Option<NetMeshBase> {
        self.inner
            .meshes
            .get(identifier)
            .and_then(|r| r.mesh.upgrade())
            .map(NetMeshBase::from_inner)
    }

    /// Identifiers of all live meshes.
    pub fn identifiers(&self) -> Vec<NetworkIdentifier> {
        self.inner
            .meshes
            .iter()
            .filter(|r| r.mesh.strong_count() > 0)
            .map(|r| r.key().clone())
            .collect()
    }

    /// Find or create the mesh behind `identifier`.
    pub async fn resolve(
        &self,
        identifier: &NetworkIdentifier,
        coherence: Option<CoherenceSpecification>,
    ) -> Result<NetMeshBase> {
        if let Some(mesh) = self.lookup(identifier) {
            return Ok(mesh);
        }
        let resolver = self
            .inner
            .resolver
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(Weak::upgrade));
        match resolver {
            Some(resolver) => resolver
                .resolve(identifier, coherence)
                .await?
                .ok_or_else(|| MeshError::access(identifier, AccessFailure::UnknownMesh)),
            None => Err(MeshError::access(identifier, AccessFailure::UnknownMesh)),
        }
    }

    /// Create a proxy pair between `local` and `remote`, wired through a pair
    /// of in-process endpoints, and install both halves.
    pub(crate) async fn connect(
        &self,
        local: &NetMeshBase,
        remote: &NetworkIdentifier,
        coherence: Option<CoherenceSpecification>,
    ) -> Result<Arc<Proxy>> {
        let partner = self.resolve(remote, coherence).await?;
        let _guard = self.inner.connect_lock.lock().await;

        // Another caller may have connected while we were resolving.
        if let Some(existing) = local.live_proxy(remote).await {
            return Ok(existing);
        }

        let local_generation = self
            .generation(local.identifier())
            .ok_or_else(|| MeshError::InvalidState {
                expected: "registered mesh".to_string(),
                actual: format!("{} not registered", local.identifier()),
            })?;
        let partner_generation = self
            .generation(partner.identifier())
            .ok_or_else(|| MeshError::access(remote, AccessFailure::UnknownMesh))?;

        let ours = Proxy::new(local.inner(), partner.identifier().clone(), partner_generation);
        let theirs = Proxy::new(partner.inner(), local.identifier().clone(), local_generation);
        connect_pair(ours.endpoint(), theirs.endpoint())?;

        local.install_proxy(Arc::clone(&ours)).await;
        partner.install_proxy(theirs).await;

        info!(
            mesh = %local.identifier(),
            partner = %remote,
            partner_generation,
            "Proxy pair connected"
        );
        Ok(ours)
    }
}

/// Everything a mesh takes from its surroundings.
#[derive(Debug, Clone)]
pub struct MeshContext {
    pub config: MeshConfig,
    pub clock: Clock,
    pub network: LocalNetwork,
}

impl MeshContext {
    /// A context with its own clock and an empty network.
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            clock: Clock::new(),
            network: LocalNetwork::new(),
        }
    }

    /// Short timings, fresh network.
    pub fn for_testing(local_identifier: &str) -> Self {
        Self::new(MeshConfig::for_testing(local_identifier))
    }

    /// Same clock, network and settings for another mesh identifier.
    pub fn sibling(&self, local_identifier: &str) -> Self {
        let mut config = self.config.clone();
        config.local_identifier = local_identifier.to_string();
        Self {
            config,
            clock: self.clock.clone(),
            network: self.network.clone(),
        }
    }
}
