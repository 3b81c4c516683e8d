//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Mesh construction helpers on a shared in-process network
//! - A recording endpoint listener
//! - A lossy transport for dropping and duplicating packets
//! - A scripted probe whose source content tests can change

#![allow(dead_code)]

use mesh_replication::endpoint::{BoxFuture, EndpointListener, Inbox, Packet, Transport, TransportError};
use mesh_replication::probe::{Probe, ProbeError, ProbeResult, StagingGraph};
use mesh_replication::{CoherenceSpecification, MeshConfig, MeshContext, NetMeshBase, NetworkIdentifier};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Install a fmt subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn context(config: MeshConfig) -> MeshContext {
    init_tracing();
    MeshContext::new(config)
}

/// A started mesh named `identifier` sharing `ctx`'s network and clock.
pub async fn started(ctx: &MeshContext, identifier: &str) -> NetMeshBase {
    let mesh = NetMeshBase::new(ctx.sibling(identifier)).expect("mesh config");
    mesh.start().await.expect("mesh start");
    mesh
}

pub fn props(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// =============================================================================
// Endpoint helpers
// =============================================================================

/// Records every delivered batch with its token.
#[derive(Default)]
pub struct RecordingListener {
    pub batches: Mutex<Vec<(i64, Vec<String>)>>,
    pub send_failures: AtomicUsize,
}

impl RecordingListener {
    pub async fn messages(&self) -> Vec<String> {
        self.batches
            .lock()
            .await
            .iter()
            .flat_map(|(_, m)| m.iter().cloned())
            .collect()
    }

    pub async fn tokens(&self) -> Vec<i64> {
        self.batches.lock().await.iter().map(|(t, _)| *t).collect()
    }
}

impl EndpointListener<String> for RecordingListener {
    fn messages_received(&self, token: i64, messages: Vec<String>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.batches.lock().await.push((token, messages));
        })
    }

    fn send_failed(&self, _token: i64) {
        self.send_failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport that can drop, duplicate or refuse packets on demand.
pub struct LossyTransport {
    inbox: Inbox<String>,
    /// Drop every n-th packet (0 = never).
    pub drop_every: AtomicUsize,
    /// Deliver every packet twice.
    pub duplicate: AtomicBool,
    /// Fail sends at the transport.
    pub refuse: AtomicBool,
    pub sent: AtomicUsize,
    pub dropped: AtomicUsize,
}

impl LossyTransport {
    pub fn new(inbox: Inbox<String>) -> Arc<Self> {
        Arc::new(Self {
            inbox,
            drop_every: AtomicUsize::new(0),
            duplicate: AtomicBool::new(false),
            refuse: AtomicBool::new(false),
            sent: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        })
    }
}

impl Transport<String> for LossyTransport {
    fn send(&self, packet: Packet<String>) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::Unreachable("refused".to_string()));
            }
            let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
            let every = self.drop_every.load(Ordering::SeqCst);
            if every > 0 && n % every == 0 {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            if self.duplicate.load(Ordering::SeqCst) {
                let _ = self.inbox.send(packet.clone());
            }
            self.inbox
                .send(packet)
                .map_err(|_| TransportError::Unreachable("closed".to_string()))
        })
    }
}

// =============================================================================
// Probe helpers
// =============================================================================

/// Probe serving whatever content the test last set.
#[derive(Default)]
pub struct ScriptedProbe {
    content: std::sync::Mutex<StagingGraph>,
    failing: AtomicBool,
    pub runs: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, content: StagingGraph) {
        if let Ok(mut slot) = self.content.lock() {
            *slot = content;
        }
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Probe for ScriptedProbe {
    fn run<'a>(
        &'a self,
        _source: &'a NetworkIdentifier,
        _coherence: &'a CoherenceSpecification,
        staging: &'a mut StagingGraph,
    ) -> BoxFuture<'a, ProbeResult<()>> {
        Box::pin(async move {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProbeError::io("source offline"));
            }
            let content = self
                .content
                .lock()
                .map(|c| c.clone())
                .map_err(|_| ProbeError::io("poisoned"))?;
            *staging = content;
            Ok(())
        })
    }
}
