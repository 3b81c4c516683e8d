//! Ping-pong endpoint behaviour over imperfect transports.
//!
//! Run with: cargo test --test endpoint_tests

mod common;

use common::{LossyTransport, RecordingListener};
use mesh_replication::endpoint::{connect_pair, ChannelTransport, EndpointPhase};
use mesh_replication::{EndpointConfig, PingPongEndpoint};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

struct Pair {
    a: PingPongEndpoint<String>,
    a_seen: Arc<RecordingListener>,
    b: PingPongEndpoint<String>,
    b_seen: Arc<RecordingListener>,
    /// Carries a's packets to b.
    a_to_b: Arc<LossyTransport>,
}

/// `a` sends through a lossy transport; `b` answers over a plain channel.
fn lossy_pair() -> Pair {
    common::init_tracing();
    let config = EndpointConfig::for_testing();
    let a_seen = Arc::new(RecordingListener::default());
    let b_seen = Arc::new(RecordingListener::default());
    let a = PingPongEndpoint::new("a->b", config.clone(), a_seen.clone());
    let b = PingPongEndpoint::new("b->a", config, b_seen.clone());

    let a_to_b = LossyTransport::new(b.inbox());
    a.set_transport(a_to_b.clone()).unwrap();
    b.set_transport(Arc::new(ChannelTransport::new("a->b", a.inbox())))
        .unwrap();
    Pair {
        a,
        a_seen,
        b,
        b_seen,
        a_to_b,
    }
}

fn start(pair: &Pair) {
    pair.b.start(false).unwrap();
    pair.a.start(true).unwrap();
}

// =============================================================================
// Token discipline
// =============================================================================

#[tokio::test(start_paused = true)]
async fn initiator_sends_odd_tokens_partner_even() {
    let pair = lossy_pair();
    pair.a.enqueue_message_for_send("a1".to_string()).await.unwrap();
    start(&pair);

    for i in 0..5 {
        sleep(Duration::from_millis(50)).await;
        pair.a.enqueue_message_for_send(format!("a{}", i + 2)).await.unwrap();
        pair.b.enqueue_message_for_send(format!("b{}", i + 1)).await.unwrap();
    }
    sleep(Duration::from_millis(200)).await;

    let at_b = pair.b_seen.tokens().await;
    let at_a = pair.a_seen.tokens().await;
    assert!(!at_b.is_empty() && !at_a.is_empty());
    assert!(at_b.iter().all(|t| t % 2 == 1), "tokens from a: {:?}", at_b);
    assert!(at_a.iter().all(|t| t % 2 == 0), "tokens from b: {:?}", at_a);
    assert!(at_b.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(at_b[0], 1);
}

#[tokio::test(start_paused = true)]
async fn idle_pair_keeps_exchanging_empty_tokens() {
    let pair = lossy_pair();
    start(&pair);
    sleep(Duration::from_millis(500)).await;

    // Nothing delivered, but the token kept moving.
    assert!(pair.b_seen.batches.lock().await.is_empty());
    assert!(pair.a.last_sent_token().await > 5);
    assert!(pair.b.last_received_token().await > 5);
}

// =============================================================================
// Respond interval
// =============================================================================

/// Step paused time 1ms at a time until `seen` has delivered `message`.
async fn wait_for(seen: &RecordingListener, message: &str, limit: Duration) -> Duration {
    let start = Instant::now();
    while !seen.messages().await.iter().any(|m| m == message) {
        assert!(start.elapsed() < limit, "{} not delivered within {:?}", message, limit);
        sleep(Duration::from_millis(1)).await;
    }
    start.elapsed()
}

#[tokio::test(start_paused = true)]
async fn ping_arrives_within_respond_interval_and_pong_within_two() {
    common::init_tracing();
    let config = EndpointConfig::default();
    assert_eq!(config.delta_respond(), Duration::from_millis(1_000));
    let respond = config.delta_respond().mul_f64(1.0 + config.random_variation / 2.0);
    let earliest = config.delta_respond().mul_f64(1.0 - config.random_variation / 2.0);
    let step = Duration::from_millis(1);

    let a_seen = Arc::new(RecordingListener::default());
    let b_seen = Arc::new(RecordingListener::default());
    let a = PingPongEndpoint::new("a", config.clone(), a_seen.clone());
    let b = PingPongEndpoint::new("b", config, b_seen.clone());
    connect_pair(&a, &b).unwrap();

    // Let the idle exchange settle into its rhythm.
    sleep(Duration::from_millis(3_500)).await;
    assert!(a.last_sent_token().await > 1);

    // Enqueue right after a's pong arrives, so a's respond timer is running.
    let before = a.last_received_token().await;
    while a.last_received_token().await == before {
        sleep(step).await;
    }
    let enqueued = Instant::now();
    a.enqueue_message_for_send("ping-1".to_string()).await.unwrap();
    let delivered = wait_for(&b_seen, "ping-1", Duration::from_secs(5)).await;
    assert!(delivered <= respond + step, "ping took {:?}", delivered);
    assert!(delivered + step >= earliest, "ping sent early after {:?}", delivered);

    b.enqueue_message_for_send("pong-1".to_string()).await.unwrap();
    wait_for(&a_seen, "pong-1", Duration::from_secs(5)).await;
    let answered = enqueued.elapsed();
    assert!(answered <= respond * 2 + step * 2, "pong took {:?}", answered);
    assert_eq!(b_seen.messages().await, vec!["ping-1".to_string()]);
}

// =============================================================================
// Loss, duplication and refusal
// =============================================================================

#[tokio::test(start_paused = true)]
async fn dropped_packets_are_recovered_in_order() {
    let pair = lossy_pair();
    pair.a_to_b.drop_every.store(2, Ordering::SeqCst);
    start(&pair);

    let expected: Vec<String> = (0..10).map(|i| format!("m{}", i)).collect();
    for message in &expected {
        pair.a.enqueue_message_for_send(message.clone()).await.unwrap();
        sleep(Duration::from_millis(30)).await;
    }
    sleep(Duration::from_secs(2)).await;

    assert!(pair.a_to_b.dropped.load(Ordering::SeqCst) > 0);
    assert_eq!(pair.b_seen.messages().await, expected);
}

#[tokio::test(start_paused = true)]
async fn duplicated_packets_deliver_once() {
    let pair = lossy_pair();
    pair.a_to_b.duplicate.store(true, Ordering::SeqCst);
    start(&pair);

    for i in 0..5 {
        pair.a.enqueue_message_for_send(format!("d{}", i)).await.unwrap();
        sleep(Duration::from_millis(40)).await;
    }
    sleep(Duration::from_millis(300)).await;

    let expected: Vec<String> = (0..5).map(|i| format!("d{}", i)).collect();
    assert_eq!(pair.b_seen.messages().await, expected);
}

#[tokio::test(start_paused = true)]
async fn refused_sends_are_retried() {
    let pair = lossy_pair();
    pair.a_to_b.refuse.store(true, Ordering::SeqCst);
    pair.a.enqueue_message_for_send("x".to_string()).await.unwrap();
    start(&pair);

    sleep(Duration::from_millis(50)).await;
    assert!(pair.a_seen.send_failures.load(Ordering::SeqCst) > 0);
    assert!(pair.b_seen.messages().await.is_empty());

    pair.a_to_b.refuse.store(false, Ordering::SeqCst);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(pair.b_seen.messages().await, vec!["x".to_string()]);
}

// =============================================================================
// Graceful death
// =============================================================================

#[tokio::test(start_paused = true)]
async fn graceful_die_drains_then_dies() {
    let pair = lossy_pair();
    start(&pair);
    sleep(Duration::from_millis(100)).await;

    pair.a.enqueue_message_for_send("bye".to_string()).await.unwrap();
    pair.a.graceful_die().await;
    assert!(pair.a.is_dying().await);
    assert!(pair.a.enqueue_message_for_send("late".to_string()).await.is_err());

    sleep(Duration::from_millis(500)).await;
    assert_eq!(pair.b_seen.messages().await, vec!["bye".to_string()]);
    assert!(pair.a.is_dead().await);
    assert_eq!(pair.a.phase().await, EndpointPhase::Dead);
}

#[tokio::test(start_paused = true)]
async fn dying_endpoint_discards_partner_messages() {
    let pair = lossy_pair();
    start(&pair);
    sleep(Duration::from_millis(100)).await;

    pair.a.graceful_die().await;
    pair.b.enqueue_message_for_send("ignored".to_string()).await.unwrap();
    sleep(Duration::from_millis(300)).await;
    assert!(pair.a_seen.messages().await.is_empty());
}
