// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures gracefully without panics,
//! deadlocks, or data corruption.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{context, props, started};
use mesh_replication::endpoint::BoxFuture;
use mesh_replication::probe::{ProbeResult, RunOutcome};
use mesh_replication::{
    AccessSpecification, CoherenceSpecification, MeshConfig, MeshError, NetworkIdentifier,
    Probe, ProbeDirectory, ProbeManager, StagingGraph,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

// =============================================================================
// Misbehaving Probes
// =============================================================================

/// Sleeps for a fixed time, tracking how many runs overlap.
struct SlowProbe {
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowProbe {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }
}

impl Probe for SlowProbe {
    fn run<'a>(
        &'a self,
        source: &'a NetworkIdentifier,
        _coherence: &'a CoherenceSpecification,
        staging: &'a mut StagingGraph,
    ) -> BoxFuture<'a, ProbeResult<()>> {
        Box::pin(async move {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            staging.put_home(props(&[("source", json!(source.as_str()))]));
            Ok(())
        })
    }
}

fn manager_with(probe: Arc<dyn Probe>) -> Arc<ProbeManager> {
    let ctx = context(MeshConfig::for_testing("http://main.example/"));
    let directory = ProbeDirectory::builder()
        .pattern(r"^http://slow\.example/", probe)
        .build()
        .unwrap();
    ProbeManager::new(ctx, Arc::new(directory))
}

/// Test: A probe that never answers fails its run instead of hanging.
#[tokio::test(start_paused = true)]
async fn hung_probe_times_out() {
    let probe = SlowProbe::new(Duration::from_secs(3_600));
    let manager = manager_with(probe);
    let source = NetworkIdentifier::parse("http://slow.example/stuck").unwrap();

    // First run times out (5s in the testing config) but the shadow exists.
    let shadow = manager.obtain_shadow(&source, None).await.unwrap();
    let stats = shadow.stats();
    assert_eq!(stats.failed_runs, 1);
    assert!(matches!(stats.last_outcome, Some(RunOutcome::Failed(_))));
    println!("Hung probe reported: {:?}", stats.last_outcome);

    // Still only the home object, created empty with the mesh.
    assert_eq!(shadow.mesh().object_count(), 1);
}

/// Test: The bulkhead caps concurrent probe runs across shadows.
#[tokio::test(start_paused = true)]
async fn concurrent_runs_are_bounded() {
    let probe = SlowProbe::new(Duration::from_millis(100));
    let manager = manager_with(probe.clone());

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let source = NetworkIdentifier::parse(&format!("http://slow.example/{}", i)).unwrap();
                manager.obtain_shadow(&source, None).await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let peak = probe.peak.load(Ordering::SeqCst);
    println!("Peak concurrent runs: {}", peak);
    assert!(peak >= 1);
    assert!(peak <= 2, "bulkhead allowed {} runs at once", peak);
    assert_eq!(manager.shadow_count(), 6);
}

/// Test: Forced runs racing the schedule never run the probe concurrently
/// for one shadow.
#[tokio::test(start_paused = true)]
async fn forced_runs_are_single_flight() {
    let probe = SlowProbe::new(Duration::from_millis(50));
    let manager = manager_with(probe.clone());
    let source = NetworkIdentifier::parse("http://slow.example/busy").unwrap();
    manager
        .obtain_shadow(
            &source,
            Some(CoherenceSpecification::Periodic {
                period: Duration::from_millis(10),
            }),
        )
        .await
        .unwrap();

    let forced: Vec<_> = (0..4)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let source = source.clone();
            tokio::spawn(async move { manager.do_update_now(&source, None).await })
        })
        .collect();
    for handle in forced {
        let report = handle.await.unwrap().unwrap();
        assert!(!report.outcome.is_failed());
    }
    assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
    manager.shutdown().await;
}

// =============================================================================
// Corrupted Traffic
// =============================================================================

/// Test: Garbage on a proxy endpoint is counted and dropped, not fatal.
#[tokio::test(start_paused = true)]
async fn malformed_proxy_messages_no_panic() {
    let ctx = context(MeshConfig::for_testing("http://a.example/"));
    let a = started(&ctx, "http://a.example/").await;
    let b = started(&ctx, "http://b.example/").await;
    b.create_object("doc", props(&[("v", json!(1))])).await.unwrap();

    let proxy = a.obtain_proxy(b.identifier()).await.unwrap();
    let garbage: &[&[u8]] = &[b"", b"{", b"\xde\xad\xbe\xef", br#"{"kind":"NoSuchThing"}"#];
    for payload in garbage {
        proxy
            .endpoint()
            .enqueue_message_for_send(payload.to_vec())
            .await
            .unwrap();
    }
    sleep(Duration::from_millis(200)).await;

    let back = b.proxy(a.identifier()).unwrap();
    assert_eq!(back.stats().malformed_messages, garbage.len() as u64);

    // The conversation carries on.
    let doc = a.access_locally(&b.identifier().object("doc")).await.unwrap();
    assert_eq!(doc.properties["v"], json!(1));
}

// =============================================================================
// Partner Failure
// =============================================================================

/// Test: A partner vanishing mid-conversation yields errors, not hangs.
#[tokio::test(start_paused = true)]
async fn partner_shutdown_during_fetches() {
    let ctx = context(MeshConfig::for_testing("http://a.example/"));
    let a = started(&ctx, "http://a.example/").await;
    let b = started(&ctx, "http://b.example/").await;
    for i in 0..10 {
        b.create_object(&format!("o{}", i), props(&[])).await.unwrap();
    }

    let fetches: Vec<_> = (0..10)
        .map(|i| {
            let a = a.clone();
            let id = b.identifier().object(format!("o{}", i));
            tokio::spawn(async move { a.access_locally(&id).await })
        })
        .collect();
    sleep(Duration::from_millis(5)).await;
    b.shutdown().await;

    let mut ok = 0;
    let mut failed = 0;
    for handle in fetches {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => {
                assert!(matches!(e, MeshError::ObjectAccess { .. }), "unexpected {:?}", e);
                failed += 1;
            }
        }
    }
    println!("Fetches during shutdown: {} ok, {} failed", ok, failed);
    assert_eq!(ok + failed, 10);
    assert_eq!(a.state(), mesh_replication::MeshState::Running);
}

/// Test: Writers racing for one lock never leave two holders behind.
#[tokio::test(start_paused = true)]
async fn racing_writers_keep_single_lock_holder() {
    let ctx = context(MeshConfig::for_testing("http://home.example/"));
    let home = started(&ctx, "http://home.example/").await;
    home.create_object("counter", props(&[("n", json!(0))])).await.unwrap();
    let id = home.identifier().object("counter");

    let mut writers = Vec::new();
    for i in 0..3 {
        writers.push(started(&ctx, &format!("http://w{}.example/", i)).await);
    }

    let tasks: Vec<_> = writers
        .iter()
        .cloned()
        .map(|writer| {
            let id = id.clone();
            tokio::spawn(async move {
                let mut attempts = 0;
                loop {
                    attempts += 1;
                    let result = writer
                        .write_with_lock(&id, |o| {
                            let n = o.properties["n"].as_i64().unwrap_or(0);
                            o.properties.insert("n".into(), json!(n + 1));
                        })
                        .await;
                    match result {
                        Ok(_) => return attempts,
                        Err(e) if e.is_retryable() || matches!(e, MeshError::NotLockOwner { .. }) => {
                            if attempts >= 20 {
                                return attempts;
                            }
                            sleep(Duration::from_millis(50)).await;
                        }
                        Err(e) => panic!("unexpected {:?}", e),
                    }
                }
            })
        })
        .collect();
    for task in tasks {
        let attempts = task.await.unwrap();
        println!("Writer finished after {} attempts", attempts);
    }
    sleep(Duration::from_millis(500)).await;

    let mut holders = 0;
    for mesh in writers.iter().chain(std::iter::once(&home)) {
        if mesh.contains(&id) && mesh.access_locally(&id).await.map(|o| o.holds_lock()).unwrap_or(false) {
            holders += 1;
        }
    }
    assert_eq!(holders, 1);
}

/// Test: Lost interest in a shadow, then renewed interest, rebuilds it.
#[tokio::test(start_paused = true)]
async fn evicted_shadow_is_rebuilt_on_access() {
    let ctx = context(MeshConfig::for_testing("http://main.example/"));
    let probe = SlowProbe::new(Duration::from_millis(1));
    let directory = ProbeDirectory::builder()
        .pattern(r"^http://slow\.example/", probe)
        .build()
        .unwrap();
    let manager = ProbeManager::new(ctx.clone(), Arc::new(directory));
    manager.start();
    let source = NetworkIdentifier::parse("http://slow.example/feed").unwrap();

    let first = manager.obtain_shadow(&source, None).await.unwrap();
    // The sweeper runs every second; grace is 60s.
    sleep(Duration::from_secs(65)).await;
    assert_eq!(manager.shadow_count(), 0);

    let main = started(&ctx, "http://main.example/").await;
    let home = main
        .access_remote(&AccessSpecification::to_home(source.clone()))
        .await
        .unwrap();
    assert_eq!(home.properties["source"], json!(source.as_str()));
    let second = manager.shadow(&source).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    manager.shutdown().await;
}
