// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Harvesting: probes, their directory, shadow meshes and scheduling.
//!
//! A [`Probe`] turns one external source into graph content. Each run fills
//! a fresh [`StagingGraph`]; the shadow then compares it against what it
//! already holds, by local name and content hash, and applies only the
//! difference. Running a probe twice against an unchanged source therefore
//! produces no events the second time.
//!
//! ```text
//!                    ProbeManager
//!            ┌────────────┼─────────────┐
//!            ▼            ▼             ▼
//!     ProbeDirectory  ShadowMeshBase  scheduling task (one per shadow)
//!      find(id)          │  ▲              │
//!                        │  └──── do_update_now ◄── RunSchedule
//!                        ▼
//!                 NetMeshBase (read-only) ◄──proxy── main meshes
//! ```

pub mod coherence;
pub mod directory;
pub mod manager;
pub mod shadow;

pub use coherence::{CoherenceSpecification, RunSchedule};
pub use directory::{ProbeDescriptor, ProbeDirectory, ProbeDirectoryBuilder, ProbeMatcher};
pub use manager::ProbeManager;
pub use shadow::{RunReport, RunStats, ShadowEvent, ShadowMeshBase};

use crate::endpoint::BoxFuture;
use crate::identifier::NetworkIdentifier;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Broad cause of a failed probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeErrorKind {
    Io,
    Parse,
    Timeout,
    Other,
}

/// A probe run failed. The shadow keeps its previous content.
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct ProbeError {
    pub kind: ProbeErrorKind,
    pub message: String,
}

impl ProbeError {
    pub fn new(kind: ProbeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ProbeErrorKind::Io, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ProbeErrorKind::Parse, message)
    }
}

pub type ProbeResult<T> = std::result::Result<T, ProbeError>;

/// Adapter for one class of external source.
///
/// Implementations must put every object the source currently has into the
/// staging graph on every run; anything left out is treated as deleted.
pub trait Probe: Send + Sync + 'static {
    fn run<'a>(
        &'a self,
        source: &'a NetworkIdentifier,
        coherence: &'a CoherenceSpecification,
        staging: &'a mut StagingGraph,
    ) -> BoxFuture<'a, ProbeResult<()>>;
}

/// One object as a probe staged it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StagedObject {
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Local names of related objects, in order.
    pub neighbors: Vec<String>,
}

impl StagedObject {
    /// Hex SHA-256 of the canonical JSON form.
    pub fn content_hash(&self) -> String {
        // Maps are ordered, so the encoding is stable.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// The object store a probe run writes into, keyed by local name.
///
/// The empty name is the shadow's home object.
#[derive(Debug, Clone, Default)]
pub struct StagingGraph {
    objects: BTreeMap<String, StagedObject>,
}

impl StagingGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the home object's properties.
    pub fn put_home(&mut self, properties: BTreeMap<String, serde_json::Value>) {
        self.put("", properties);
    }

    /// Create or replace an object's properties, keeping its neighbours.
    pub fn put(&mut self, local: &str, properties: BTreeMap<String, serde_json::Value>) {
        self.objects.entry(local.to_string()).or_default().properties = properties;
    }

    /// Record that `from` relates to `to`. Both are created if missing.
    pub fn relate(&mut self, from: &str, to: &str) {
        self.objects.entry(to.to_string()).or_default();
        let neighbors = &mut self.objects.entry(from.to_string()).or_default().neighbors;
        if !neighbors.iter().any(|n| n == to) {
            neighbors.push(to.to_string());
        }
    }

    pub fn remove(&mut self, local: &str) -> Option<StagedObject> {
        let removed = self.objects.remove(local);
        for object in self.objects.values_mut() {
            object.neighbors.retain(|n| n != local);
        }
        removed
    }

    pub fn get(&self, local: &str) -> Option<&StagedObject> {
        self.objects.get(local)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StagedObject)> {
        self.objects.iter()
    }

    /// Compare against the content hashes of what the shadow holds.
    ///
    /// The home object is never reported deleted.
    pub fn diff(&self, current: &BTreeMap<String, String>) -> ChangeSet {
        let mut changes = ChangeSet::default();
        for (local, object) in &self.objects {
            match current.get(local) {
                None => changes.created.push(local.clone()),
                Some(hash) if *hash != object.content_hash() => changes.updated.push(local.clone()),
                Some(_) => {}
            }
        }
        changes.deleted = current
            .keys()
            .filter(|local| !local.is_empty() && !self.objects.contains_key(*local))
            .cloned()
            .collect();
        changes
    }

    pub(crate) fn into_objects(self) -> BTreeMap<String, StagedObject> {
        self.objects
    }
}

/// One change a run produced, by local name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    ObjectCreated(String),
    ObjectUpdated(String),
    ObjectDeleted(String),
}

/// Difference between a staging graph and the shadow's content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.created
            .iter()
            .cloned()
            .map(ChangeEvent::ObjectCreated)
            .chain(self.updated.iter().cloned().map(ChangeEvent::ObjectUpdated))
            .chain(self.deleted.iter().cloned().map(ChangeEvent::ObjectDeleted))
            .collect()
    }
}

/// What one run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Applied this many changes.
    Changed(usize),
    Unchanged,
    /// The probe failed; nothing was applied.
    Failed(String),
}

impl RunOutcome {
    pub fn is_changed(&self) -> bool {
        matches!(self, RunOutcome::Changed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RunOutcome::Failed(_))
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            RunOutcome::Changed(_) => "changed",
            RunOutcome::Unchanged => "unchanged",
            RunOutcome::Failed(_) => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: i64) -> BTreeMap<String, serde_json::Value> {
        let mut map = BTreeMap::new();
        map.insert("v".to_string(), json!(value));
        map
    }

    fn hashes(staging: &StagingGraph) -> BTreeMap<String, String> {
        staging
            .iter()
            .map(|(k, v)| (k.clone(), v.content_hash()))
            .collect()
    }

    #[test]
    fn test_relate_creates_both_ends_once() {
        let mut staging = StagingGraph::new();
        staging.relate("a", "b");
        staging.relate("a", "b");
        assert_eq!(staging.len(), 2);
        assert_eq!(staging.get("a").unwrap().neighbors, vec!["b".to_string()]);
    }

    #[test]
    fn test_remove_drops_dangling_neighbours() {
        let mut staging = StagingGraph::new();
        staging.relate("a", "b");
        assert!(staging.remove("b").is_some());
        assert!(staging.get("a").unwrap().neighbors.is_empty());
    }

    #[test]
    fn test_content_hash_depends_on_content_only() {
        let mut one = StagingGraph::new();
        one.put("x", props(1));
        let mut two = StagingGraph::new();
        two.put("x", props(1));
        assert_eq!(
            one.get("x").unwrap().content_hash(),
            two.get("x").unwrap().content_hash()
        );
        two.put("x", props(2));
        assert_ne!(
            one.get("x").unwrap().content_hash(),
            two.get("x").unwrap().content_hash()
        );
    }

    #[test]
    fn test_diff_classifies_changes() {
        let mut before = StagingGraph::new();
        before.put_home(props(0));
        before.put("keep", props(1));
        before.put("edit", props(1));
        before.put("drop", props(1));
        let current = hashes(&before);

        let mut after = StagingGraph::new();
        after.put("keep", props(1));
        after.put("edit", props(2));
        after.put("new", props(1));

        let changes = after.diff(&current);
        assert_eq!(changes.created, vec!["new".to_string()]);
        assert_eq!(changes.updated, vec!["edit".to_string()]);
        // Home is left out of deletions even though the run skipped it.
        assert_eq!(changes.deleted, vec!["drop".to_string()]);
        assert_eq!(changes.len(), 3);
        assert_eq!(changes.events()[0], ChangeEvent::ObjectCreated("new".to_string()));
    }

    #[test]
    fn test_identical_run_yields_no_changes() {
        let mut staging = StagingGraph::new();
        staging.put("a", props(1));
        staging.relate("a", "b");
        let current = hashes(&staging);
        assert!(staging.clone().diff(&current).is_empty());
    }

    #[test]
    fn test_run_outcome_labels() {
        assert!(RunOutcome::Changed(2).is_changed());
        assert!(RunOutcome::Failed("x".into()).is_failed());
        assert_eq!(RunOutcome::Unchanged.label(), "unchanged");
    }
}
