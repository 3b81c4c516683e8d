//! Shadow meshes: disposable mirrors of one external source.
//!
//! A [`ShadowMeshBase`] wraps a read-only [`NetMeshBase`] registered under
//! the source's identifier, so main meshes reach it through ordinary
//! proxies. Its content only changes through probe runs:
//!
//! ```text
//! do_update_now ──► probe.run(staging) ──► diff by content hash ──► apply
//!      │ (single-flight)       │ error / timeout                      │
//!      │                       ▼                                      ▼
//!      │               RunFailed, content kept        PushChange / CancelLease
//!      ▼                                              to replica holders
//!  RunSchedule.record(outcome) ──► next delay
//! ```
//!
//! # Lifetime
//!
//! A shadow is *needed* while any of its objects lists a proxy, i.e. some
//! mesh holds a replica. Once not needed and unaccessed for the grace
//! period it may be discarded by the manager.

use super::coherence::{CoherenceSpecification, RunSchedule};
use super::directory::ProbeDescriptor;
use super::{ChangeEvent, ChangeSet, ProbeError, ProbeErrorKind, RunOutcome, StagingGraph};
use crate::clock::{millis_between, Timestamp, NEVER};
use crate::error::{MeshError, Result};
use crate::identifier::{NetworkIdentifier, ObjectIdentifier};
use crate::mesh::NetMeshBase;
use crate::metrics;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, instrument, warn};

const EVENT_CAPACITY: usize = 256;

/// Lifecycle notifications of a shadow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowEvent {
    ObjectCreated(ObjectIdentifier),
    ObjectUpdated(ObjectIdentifier),
    ObjectDeleted(ObjectIdentifier),
    RunCompleted { changes: usize },
    RunFailed { message: String },
}

/// Counters over a shadow's runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub changes_applied: u64,
    pub last_outcome: Option<RunOutcome>,
    pub last_duration: Option<Duration>,
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub changes: ChangeSet,
    /// When the schedule wants the next run; `None` = not again.
    pub next_delay: Option<Duration>,
    pub duration: Duration,
}

/// A read-only mesh kept in step with one external source.
pub struct ShadowMeshBase {
    source: NetworkIdentifier,
    mesh: NetMeshBase,
    descriptor: Arc<ProbeDescriptor>,
    grace: Duration,
    run_timeout: Duration,
    /// Content hash per local name; the lock makes runs single-flight.
    content: Mutex<BTreeMap<String, String>>,
    schedule: std::sync::Mutex<RunSchedule>,
    stats: std::sync::Mutex<RunStats>,
    time_of_last_run: AtomicI64,
    time_of_last_successful_run: AtomicI64,
    time_discovered_not_needed: AtomicI64,
    events: broadcast::Sender<ShadowEvent>,
    ready_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ShadowMeshBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowMeshBase")
            .field("source", &self.source)
            .field("probe", &self.descriptor.name())
            .field("time_of_last_run", &self.time_of_last_run())
            .finish()
    }
}

impl ShadowMeshBase {
    pub(crate) fn new(
        mesh: NetMeshBase,
        descriptor: Arc<ProbeDescriptor>,
        coherence: CoherenceSpecification,
        grace: Duration,
        run_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (ready_tx, _) = watch::channel(false);
        Self {
            source: mesh.identifier().clone(),
            mesh,
            descriptor,
            grace,
            run_timeout,
            content: Mutex::new(BTreeMap::new()),
            schedule: std::sync::Mutex::new(RunSchedule::new(coherence)),
            stats: std::sync::Mutex::new(RunStats::default()),
            time_of_last_run: AtomicI64::new(NEVER),
            time_of_last_successful_run: AtomicI64::new(NEVER),
            time_discovered_not_needed: AtomicI64::new(NEVER),
            events,
            ready_tx,
        }
    }

    /// The external identifier this shadow mirrors.
    pub fn source(&self) -> &NetworkIdentifier {
        &self.source
    }

    pub fn mesh(&self) -> &NetMeshBase {
        &self.mesh
    }

    pub fn descriptor(&self) -> &Arc<ProbeDescriptor> {
        &self.descriptor
    }

    /// Grace period after the last access before an unneeded shadow goes.
    pub fn time_not_needed_till_expires(&self) -> Duration {
        self.grace
    }

    pub fn coherence(&self) -> CoherenceSpecification {
        self.schedule
            .lock()
            .map(|s| s.specification().clone())
            .unwrap_or_default()
    }

    pub fn next_delay(&self) -> Option<Duration> {
        self.schedule.lock().ok().and_then(|s| s.next_delay())
    }

    pub fn stats(&self) -> RunStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn time_of_last_run(&self) -> Timestamp {
        self.time_of_last_run.load(Ordering::Relaxed)
    }

    pub fn time_of_last_successful_run(&self) -> Timestamp {
        self.time_of_last_successful_run.load(Ordering::Relaxed)
    }

    /// When the shadow was first seen not needed; `NEVER` while needed.
    pub fn time_discovered_not_needed(&self) -> Timestamp {
        self.time_discovered_not_needed.load(Ordering::Relaxed)
    }

    pub fn last_access(&self) -> Timestamp {
        self.mesh.last_access()
    }

    pub(crate) fn touch(&self) {
        self.mesh.touch();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShadowEvent> {
        self.events.subscribe()
    }

    /// Wait until the first run has finished, successfully or not.
    pub async fn ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Whether some mesh holds a replica of any object here.
    pub async fn is_needed(&self) -> bool {
        for identifier in self.mesh.object_identifiers() {
            if let Some(cell) = self.mesh.cell(&identifier) {
                if !cell.read().await.proxies.is_empty() {
                    return true;
                }
            }
        }
        false
    }

    /// Not needed, and not accessed for the grace period.
    pub async fn may_be_deleted(&self, now: Timestamp) -> bool {
        if self.is_needed().await {
            self.time_discovered_not_needed.store(NEVER, Ordering::Relaxed);
            return false;
        }
        let _ = self.time_discovered_not_needed.compare_exchange(
            NEVER,
            now,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        let grace_ms = u64::try_from(self.grace.as_millis()).unwrap_or(u64::MAX);
        millis_between(self.last_access(), now) >= grace_ms
    }

    /// Run the probe now and apply what changed.
    ///
    /// Waits for a run already in flight, then runs again. A
    /// `coherence_override` replaces the shadow's policy from here on.
    #[instrument(skip(self, coherence_override), fields(source = %self.source))]
    pub async fn do_update_now(&self, coherence_override: Option<CoherenceSpecification>) -> RunReport {
        let mut content = self.content.lock().await;

        let coherence = match self.schedule.lock() {
            Ok(mut schedule) => {
                if let Some(coherence) = coherence_override {
                    schedule.set_specification(coherence);
                }
                schedule.specification().clone()
            }
            Err(_) => CoherenceSpecification::default(),
        };

        let started = Instant::now();
        let now = self.mesh.clock().now();
        self.time_of_last_run.store(now, Ordering::Relaxed);

        let mut staging = StagingGraph::new();
        let run = tokio::time::timeout(
            self.run_timeout,
            self.descriptor.probe().run(&self.source, &coherence, &mut staging),
        )
        .await;
        let run = match run {
            Ok(result) => result,
            Err(_) => Err(ProbeError::new(
                ProbeErrorKind::Timeout,
                format!("no result within {:?}", self.run_timeout),
            )),
        };

        let (outcome, changes) = match run {
            Ok(()) => {
                let changes = staging.diff(&content);
                match self.apply(&mut content, staging, &changes).await {
                    Ok(()) if changes.is_empty() => (RunOutcome::Unchanged, changes),
                    Ok(()) => (RunOutcome::Changed(changes.len()), changes),
                    Err(e) => (RunOutcome::Failed(e.to_string()), ChangeSet::default()),
                }
            }
            Err(e) => {
                let error = MeshError::ProbeRun {
                    source_id: self.source.to_string(),
                    message: e.to_string(),
                };
                (RunOutcome::Failed(error.to_string()), ChangeSet::default())
            }
        };
        drop(content);

        let duration = started.elapsed();
        let next_delay = match self.schedule.lock() {
            Ok(mut schedule) => schedule.record(&outcome),
            Err(_) => None,
        };
        self.record(&outcome, &changes, duration);
        self.publish(&outcome, &changes);
        self.ready_tx.send_replace(true);

        metrics::record_probe_run(self.source.as_str(), outcome.label(), duration);
        metrics::set_next_run_delay(self.source.as_str(), next_delay);
        match &outcome {
            RunOutcome::Changed(n) => {
                metrics::record_probe_changes(
                    self.source.as_str(),
                    changes.created.len(),
                    changes.updated.len(),
                    changes.deleted.len(),
                );
                info!(changes = n, ?next_delay, "Probe run applied changes");
            }
            RunOutcome::Unchanged => debug!(?next_delay, "Probe run found no changes"),
            RunOutcome::Failed(message) => {
                warn!(error = %message, ?next_delay, "Probe run failed, keeping previous content")
            }
        }

        RunReport {
            outcome,
            changes,
            next_delay,
            duration,
        }
    }

    async fn apply(
        &self,
        content: &mut BTreeMap<String, String>,
        staging: StagingGraph,
        changes: &ChangeSet,
    ) -> Result<()> {
        let objects = staging.into_objects();
        for local in changes.created.iter().chain(&changes.updated) {
            let Some(staged) = objects.get(local) else {
                continue;
            };
            let neighbors = staged
                .neighbors
                .iter()
                .map(|n| self.source.object(n.as_str()))
                .collect();
            self.mesh
                .store_owned(local, staged.properties.clone(), neighbors)
                .await?;
            content.insert(local.clone(), staged.content_hash());
        }

        for local in &changes.updated {
            let identifier = self.source.object(local.as_str());
            if let Some(cell) = self.mesh.cell(&identifier) {
                self.mesh.notify_replicas(&identifier, &cell).await;
            }
        }

        for local in &changes.deleted {
            self.mesh.remove_owned(&self.source.object(local.as_str())).await;
            content.remove(local);
        }
        Ok(())
    }

    fn record(&self, outcome: &RunOutcome, changes: &ChangeSet, duration: Duration) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.runs += 1;
            if outcome.is_failed() {
                stats.failed_runs += 1;
            } else {
                stats.successful_runs += 1;
                stats.changes_applied += changes.len() as u64;
            }
            stats.last_outcome = Some(outcome.clone());
            stats.last_duration = Some(duration);
        }
        if !outcome.is_failed() {
            self.time_of_last_successful_run
                .store(self.time_of_last_run(), Ordering::Relaxed);
        }
    }

    fn publish(&self, outcome: &RunOutcome, changes: &ChangeSet) {
        // Nobody listening is fine.
        let send = |event| {
            let _ = self.events.send(event);
        };
        if let RunOutcome::Failed(message) = outcome {
            send(ShadowEvent::RunFailed {
                message: message.clone(),
            });
            return;
        }
        for event in changes.events() {
            send(match event {
                ChangeEvent::ObjectCreated(local) => ShadowEvent::ObjectCreated(self.source.object(local)),
                ChangeEvent::ObjectUpdated(local) => ShadowEvent::ObjectUpdated(self.source.object(local)),
                ChangeEvent::ObjectDeleted(local) => ShadowEvent::ObjectDeleted(self.source.object(local)),
            });
        }
        send(ShadowEvent::RunCompleted {
            changes: changes.len(),
        });
    }
}
