//! # Mesh Replication
//!
//! A federated graph store. Each mesh owns a set of graph objects and caches
//! replicas of objects owned by other meshes, fetched lazily on first access
//! and kept fresh by lease.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           NetMeshBase (A)                                │
//! │                                                                          │
//! │  ┌──────────────┐   ┌────────────────┐   ┌──────────────────────────┐    │
//! │  │ object cache │◄──│ Proxy (A ↔ B)  │◄─►│ PingPongEndpoint         │◄───┼──┐
//! │  │ leases/locks │   │ fetch, lock,   │   │ token, batching, resend  │    │  │
//! │  └──────────────┘   │ push, cancel   │   └──────────────────────────┘    │  │
//! │                     └────────────────┘                                   │  │
//! └──────────────────────────────────────────────────────────────────────────┘  │
//!                                                                               │
//!   LocalNetwork: identifier ──► mesh  (falls back to the ProbeManager)         │
//!                                                                               │
//! ┌──────────────────────────────────────────────────────────────────────────┐  │
//! │  ProbeManager ──► ProbeDirectory ──► Probe                               │  │
//! │       │                                                                  │  │
//! │       └──► ShadowMeshBase ──► NetMeshBase (read-only, B) ◄───────────────┼──┘
//! │              scheduled by CoherenceSpecification                         │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Ways In
//!
//! 1. **Peer meshes**: meshes registered on the same [`LocalNetwork`] reach
//!    each other through proxy pairs.
//! 2. **Shadows**: an identifier nobody registered is handed to the
//!    [`ProbeManager`], which mirrors the external source into a read-only
//!    mesh.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mesh_replication::{MeshConfig, MeshContext, NetMeshBase, ObjectIdentifier};
//! use std::collections::BTreeMap;
//!
//! #[tokio::main]
//! async fn main() -> mesh_replication::Result<()> {
//!     let context = MeshContext::new(MeshConfig::for_testing("http://a.example/"));
//!     let a = NetMeshBase::new(context.clone())?;
//!     let b = NetMeshBase::new(context.sibling("http://b.example/"))?;
//!     a.start().await?;
//!     b.start().await?;
//!
//!     b.create_object("doc", BTreeMap::new()).await?;
//!     let doc = a.access_locally(&ObjectIdentifier::parse("http://b.example/#doc")?).await?;
//!     println!("replicated {}", doc.identifier);
//!
//!     a.shutdown().await;
//!     b.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod identifier;
pub mod mesh;
pub mod metrics;
pub mod object;
pub mod probe;
pub mod proxy;
pub mod resilience;
pub mod wire;

// Re-exports for convenience
pub use clock::{Clock, Timestamp};
pub use config::{EndpointConfig, LeaseConfig, MeshConfig, MeshSettings, ProbeConfig};
pub use endpoint::{EndpointListener, Message, PingPongEndpoint};
pub use error::{AccessFailure, MeshError, Result};
pub use identifier::{NetworkIdentifier, ObjectIdentifier};
pub use mesh::{AccessSpecification, LocalNetwork, MeshContext, MeshHealth, MeshState, NetMeshBase};
pub use object::GraphObject;
pub use probe::{
    CoherenceSpecification, Probe, ProbeDirectory, ProbeError, ProbeManager, ProbeResult,
    ShadowMeshBase, StagingGraph,
};
pub use proxy::Proxy;
pub use wire::{ObjectSnapshot, ProxyMessage};
