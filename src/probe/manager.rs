// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Probe manager: creates shadows on demand, schedules their runs and
//! discards them when nobody needs them any more.
//!
//! The manager resolves identifiers the [`LocalNetwork`](crate::mesh::LocalNetwork)
//! has no mesh for. Creating the manager installs it as the network's
//! resolver, so `access_remote` on any mesh transparently harvests external
//! sources.
//!
//! # Tasks
//!
//! ```text
//! per shadow:  select! { stop │ reschedule (Notify) │ sleep(next delay) }
//!                                                      │
//!                                 rate limiter ──► bulkhead permit ──► run
//!
//! sweeper:     every sweep_interval ──► evict_expired()
//! ```
//!
//! All runs go through one [`Bulkhead`], which bounds how many probes run
//! at once no matter how many shadows exist.

use super::coherence::CoherenceSpecification;
use super::directory::ProbeDirectory;
use super::shadow::{RunReport, ShadowMeshBase};
use crate::endpoint::BoxFuture;
use crate::error::{AccessFailure, MeshError, Result};
use crate::identifier::NetworkIdentifier;
use crate::mesh::{MeshContext, MeshResolver, NetMeshBase};
use crate::metrics;
use crate::resilience::{Bulkhead, RateLimiter};
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

/// Extra time, beyond the run timeout, a stopping task gets to finish.
const TASK_STOP_MARGIN: Duration = Duration::from_secs(1);

struct ShadowEntry {
    shadow: Arc<ShadowMeshBase>,
    reschedule: Arc<Notify>,
    stop_tx: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Owner of every shadow in a network.
pub struct ProbeManager {
    context: MeshContext,
    directory: Arc<ProbeDirectory>,
    shadows: DashMap<NetworkIdentifier, Arc<ShadowEntry>>,
    bulkhead: Arc<Bulkhead>,
    rate_limiter: Option<Arc<RateLimiter>>,
    /// Serializes shadow creation and eviction.
    obtain_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProbeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeManager")
            .field("shadows", &self.shadows.len())
            .field("probes", &self.directory.len())
            .finish()
    }
}

impl ProbeManager {
    /// Create a manager and install it as `context.network`'s resolver.
    ///
    /// Shadow meshes take their settings from `context.config`.
    pub fn new(context: MeshContext, directory: Arc<ProbeDirectory>) -> Arc<Self> {
        let probe = &context.config.settings.probe;
        let bulkhead = Arc::new(Bulkhead::for_probe_runs(probe.max_concurrent_runs));
        let rate_limiter = probe
            .rate_limit_config()
            .map(|config| Arc::new(RateLimiter::new(config)));
        let (shutdown_tx, _) = watch::channel(false);

        let manager = Arc::new(Self {
            context,
            directory,
            shadows: DashMap::new(),
            bulkhead,
            rate_limiter,
            obtain_lock: Mutex::new(()),
            shutdown_tx,
            sweeper: std::sync::Mutex::new(None),
        });
        let resolver: Weak<dyn MeshResolver> = Arc::<ProbeManager>::downgrade(&manager);
        manager.context.network.set_resolver(resolver);
        manager
    }

    /// Start the eviction sweeper.
    pub fn start(self: &Arc<Self>) {
        let interval = self.context.config.settings.probe.sweep_interval();
        let manager = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(
            async move {
                let mut timer = tokio::time::interval(interval);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                timer.tick().await;
                loop {
                    tokio::select! {
                        biased;

                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                debug!("Shadow sweeper stopping");
                                break;
                            }
                        }

                        _ = timer.tick() => {
                            let Some(manager) = manager.upgrade() else {
                                break;
                            };
                            manager.evict_expired().await;
                        }
                    }
                }
            }
            .instrument(info_span!("shadow_sweeper")),
        );
        if let Ok(mut slot) = self.sweeper.lock() {
            *slot = Some(handle);
        }
        info!(?interval, "Probe manager started");
    }

    pub fn directory(&self) -> &Arc<ProbeDirectory> {
        &self.directory
    }

    /// The live shadow for `source`, without creating one.
    pub fn shadow(&self, source: &NetworkIdentifier) -> Option<Arc<ShadowMeshBase>> {
        self.shadows.get(source).map(|e| Arc::clone(&e.value().shadow))
    }

    pub fn shadow_count(&self) -> usize {
        self.shadows.len()
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Return the shadow mirroring `source`, creating it if needed.
    ///
    /// An existing shadow within its grace period is returned as is, with
    /// its access time refreshed. One past its grace period is discarded and
    /// replaced. A new shadow has finished its first run when this returns.
    #[instrument(skip(self, coherence), fields(source = %source))]
    pub async fn obtain_shadow(
        &self,
        source: &NetworkIdentifier,
        coherence: Option<CoherenceSpecification>,
    ) -> Result<Arc<ShadowMeshBase>> {
        if self.is_shut_down() {
            return Err(MeshError::Shutdown);
        }

        let shadow = {
            let _creating = self.obtain_lock.lock().await;

            let existing = self.shadows.get(source).map(|e| Arc::clone(e.value()));
            if let Some(entry) = existing {
                let now = self.context.clock.now();
                if !entry.shadow.may_be_deleted(now).await {
                    entry.shadow.touch();
                    return Ok(Arc::clone(&entry.shadow));
                }
                debug!("Shadow past its grace period, replacing");
                self.evict_entry(source).await;
            }

            let descriptor = self.directory.find(source)?;
            let coherence = coherence
                .or_else(|| descriptor.default_coherence().cloned())
                .unwrap_or_else(|| self.context.config.settings.probe.default_coherence());
            coherence.validate()?;

            let mesh = NetMeshBase::new_read_only(self.context.sibling(source.as_str()))?;
            mesh.start().await?;
            let probe_config = &self.context.config.settings.probe;
            let shadow = Arc::new(ShadowMeshBase::new(
                mesh,
                descriptor,
                coherence.clone(),
                probe_config.shadow_grace(),
                probe_config.run_timeout(),
            ));

            let reschedule = Arc::new(Notify::new());
            let (stop_tx, stop_rx) = watch::channel(false);
            let task = tokio::spawn(
                run_schedule(
                    Arc::clone(&shadow),
                    Arc::clone(&reschedule),
                    Arc::clone(&self.bulkhead),
                    self.rate_limiter.clone(),
                    stop_rx,
                )
                .instrument(info_span!("shadow_schedule", source = %source)),
            );
            self.shadows.insert(
                source.clone(),
                Arc::new(ShadowEntry {
                    shadow: Arc::clone(&shadow),
                    reschedule,
                    stop_tx,
                    task: std::sync::Mutex::new(Some(task)),
                }),
            );
            metrics::set_shadow_count(self.shadows.len());
            info!(probe = shadow.descriptor().name(), %coherence, "Shadow created");
            shadow
        };

        shadow.ready().await;
        Ok(shadow)
    }

    /// Run the shadow's probe now and restart its timer from the result.
    pub async fn do_update_now(
        &self,
        source: &NetworkIdentifier,
        coherence_override: Option<CoherenceSpecification>,
    ) -> Result<RunReport> {
        let entry = self
            .shadows
            .get(source)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| MeshError::access(source, AccessFailure::UnknownMesh))?;
        if let Some(coherence) = &coherence_override {
            coherence.validate()?;
        }

        let _permit = self
            .bulkhead
            .acquire()
            .await
            .map_err(|_| MeshError::Shutdown)?;
        let report = entry.shadow.do_update_now(coherence_override).await;
        entry.reschedule.notify_one();
        Ok(report)
    }

    /// Discard every shadow that is not needed and past its grace period.
    ///
    /// Returns the number discarded.
    pub async fn evict_expired(&self) -> usize {
        let _evicting = self.obtain_lock.lock().await;
        let now = self.context.clock.now();

        let entries: Vec<Arc<ShadowEntry>> = self.shadows.iter().map(|e| Arc::clone(e.value())).collect();
        let mut evicted = 0;
        for entry in entries {
            if entry.shadow.may_be_deleted(now).await {
                self.evict_entry(entry.shadow.source()).await;
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, remaining = self.shadows.len(), "Expired shadows discarded");
        }
        evicted
    }

    /// Stop the shadow's task, put its proxies to rest and leave the network.
    async fn evict_entry(&self, source: &NetworkIdentifier) {
        let Some((_, entry)) = self.shadows.remove(source) else {
            return;
        };
        let _ = entry.stop_tx.send(true);

        let handle = entry.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let limit = self.context.config.settings.probe.run_timeout() + TASK_STOP_MARGIN;
            let abort = handle.abort_handle();
            match tokio::time::timeout(limit, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(source = %source, error = %e, "Shadow task panicked"),
                Err(_) => {
                    warn!(source = %source, "Shadow task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        entry.shadow.mesh().shutdown().await;
        metrics::record_shadow_evicted(source.as_str());
        metrics::set_shadow_count(self.shadows.len());
        info!(source = %source, "Shadow discarded");
    }

    /// Stop the sweeper and every shadow.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!(shadows = self.shadows.len(), "Shutting down probe manager");

        let sweeper = self.sweeper.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                warn!(error = %e, "Shadow sweeper panicked");
            }
        }

        let _evicting = self.obtain_lock.lock().await;
        let sources: Vec<NetworkIdentifier> = self.shadows.iter().map(|e| e.key().clone()).collect();
        for source in sources {
            self.evict_entry(&source).await;
        }
        self.bulkhead.close();
        info!("Probe manager stopped");
    }
}

impl MeshResolver for ProbeManager {
    fn resolve(
        &self,
        identifier: &NetworkIdentifier,
        coherence: Option<CoherenceSpecification>,
    ) -> BoxFuture<'_, Result<Option<NetMeshBase>>> {
        let identifier = identifier.clone();
        Box::pin(async move {
            let shadow = self.obtain_shadow(&identifier, coherence).await?;
            Ok(Some(shadow.mesh().clone()))
        })
    }
}

async fn sleep_or_park(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending::<()>().await,
    }
}

/// One shadow's scheduling loop. The first run is immediate.
async fn run_schedule(
    shadow: Arc<ShadowMeshBase>,
    reschedule: Arc<Notify>,
    bulkhead: Arc<Bulkhead>,
    rate_limiter: Option<Arc<RateLimiter>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut delay = Some(Duration::ZERO);
    loop {
        tokio::select! {
            biased;

            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }

            _ = reschedule.notified() => {
                // A forced run happened; count from its result.
                delay = shadow.next_delay();
                debug!(?delay, "Shadow rescheduled");
                continue;
            }

            _ = sleep_or_park(delay) => {}
        }

        if let Some(limiter) = &rate_limiter {
            limiter.acquire().await;
        }
        let Ok(_permit) = bulkhead.acquire().await else {
            break;
        };
        delay = shadow.do_update_now(None).await.next_delay;
    }
    debug!("Shadow schedule stopped");
}
