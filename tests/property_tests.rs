//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use mesh_replication::endpoint::state::{Acceptance, ProtocolState};
use mesh_replication::probe::{RunOutcome, RunSchedule, StagingGraph};
use mesh_replication::wire::decode_message;
use mesh_replication::{CoherenceSpecification, NetworkIdentifier, ObjectIdentifier};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

// =============================================================================
// Ping-Pong Protocol Properties
// =============================================================================

proptest! {
    /// Whatever packets are lost or duplicated, the partner sees every
    /// message exactly once and in order.
    #[test]
    fn ping_pong_delivers_exactly_once_in_order(
        messages in prop::collection::vec("[a-z]{1,6}", 0..20),
        losses in prop::collection::vec(any::<bool>(), 0..60),
        duplicates in prop::collection::vec(any::<bool>(), 0..60),
    ) {
        let mut sides = [ProtocolState::<String>::new(), ProtocolState::<String>::new()];
        let mut pending = messages.iter().cloned();
        let mut delivered = Vec::new();
        let mut tokens_at_b = Vec::new();
        let mut sender = 0usize;

        // Once the loss script runs out every packet arrives, so this many
        // steps always drains the queue.
        let steps = losses.len() + 2 * messages.len() + 4;
        for step in 0..steps {
            if sender == 0 {
                if let Some(message) = pending.next() {
                    sides[0].enqueue(message);
                }
            }
            let round = sides[sender]
                .prepare_send()
                .map_err(|m| TestCaseError::fail(format!("step {}: {:?}", step, m)))?;

            if losses.get(step).copied().unwrap_or(false) {
                // Lost: the sender's recover timer fires next.
                continue;
            }
            let receiver = 1 - sender;
            let copies = if duplicates.get(step).copied().unwrap_or(false) { 2 } else { 1 };
            for _ in 0..copies {
                if let Acceptance::Deliver { token, messages } = sides[receiver].accept(round.packet.clone()) {
                    if receiver == 1 {
                        tokens_at_b.push(token);
                        delivered.extend(messages);
                    }
                }
            }
            sender = receiver;
        }

        prop_assert_eq!(delivered, messages);
        prop_assert!(tokens_at_b.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(tokens_at_b.iter().all(|t| t % 2 == 1));
    }
}

// =============================================================================
// Identifier Properties
// =============================================================================

proptest! {
    /// Object identifiers survive their text form.
    #[test]
    fn object_identifier_text_round_trip(
        host in "[a-z]{1,10}\\.example",
        path in "(/[a-z0-9]{1,6}){0,3}",
        local in "[a-zA-Z0-9_-]{0,12}",
    ) {
        let mesh = NetworkIdentifier::parse(&format!("http://{}{}", host, path)).unwrap();
        let id = mesh.object(local.clone());
        let parsed = ObjectIdentifier::parse(&id.to_string()).unwrap();
        prop_assert_eq!(parsed.mesh(), &mesh);
        prop_assert_eq!(parsed.local(), local.as_str());
        prop_assert_eq!(parsed.is_home(), local.is_empty());
    }

    /// Parsing is canonicalizing: parse(display(parse(s))) == parse(s).
    #[test]
    fn network_identifier_parse_is_idempotent(raw in "[a-z]{1,5}://[a-zA-Z0-9.]{1,12}(/[a-z]{0,5}){0,2}") {
        if let Ok(first) = NetworkIdentifier::parse(&raw) {
            let second = NetworkIdentifier::parse(first.as_str()).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}

// =============================================================================
// Coherence Properties
// =============================================================================

fn adaptive_spec() -> impl Strategy<Value = CoherenceSpecification> {
    (1u64..10_000, 1u64..1_000_000, 10u32..40).prop_map(|(fallback, extra, tenths)| {
        CoherenceSpecification::AdaptivePeriodic {
            fallback_delay: Duration::from_millis(fallback),
            max_delay: Duration::from_millis(fallback + extra),
            adaptive_factor: f64::from(tenths) / 10.0,
        }
    })
}

fn outcome() -> impl Strategy<Value = RunOutcome> {
    prop_oneof![
        (1usize..10).prop_map(RunOutcome::Changed),
        Just(RunOutcome::Unchanged),
        Just(RunOutcome::Failed("boom".to_string())),
    ]
}

proptest! {
    /// Text form round-trips for every valid specification.
    #[test]
    fn coherence_text_round_trip(spec in adaptive_spec(), period in 1u64..u32::MAX as u64) {
        let periodic = CoherenceSpecification::Periodic { period: Duration::from_millis(period) };
        for spec in [spec, periodic, CoherenceSpecification::OneTimeOnly] {
            let parsed: CoherenceSpecification = spec.to_string().parse().unwrap();
            prop_assert_eq!(parsed, spec);
        }
    }

    /// The adaptive delay never leaves [fallback, max].
    #[test]
    fn adaptive_delay_stays_in_bounds(
        spec in adaptive_spec(),
        outcomes in prop::collection::vec(outcome(), 1..50),
    ) {
        let (low, high) = match &spec {
            CoherenceSpecification::AdaptivePeriodic { fallback_delay, max_delay, .. } => (*fallback_delay, *max_delay),
            _ => unreachable!(),
        };
        let mut schedule = RunSchedule::new(spec);
        for outcome in &outcomes {
            let delay = schedule.record(outcome).unwrap();
            prop_assert!(delay >= low && delay <= high, "{:?} outside [{:?}, {:?}]", delay, low, high);
        }
    }

    /// A failed run never moves the schedule.
    #[test]
    fn failed_run_keeps_delay(spec in adaptive_spec(), before in prop::collection::vec(outcome(), 0..10)) {
        let mut schedule = RunSchedule::new(spec);
        for outcome in &before {
            schedule.record(outcome);
        }
        let delay = schedule.next_delay();
        prop_assert_eq!(schedule.record(&RunOutcome::Failed("x".into())), delay);
    }
}

// =============================================================================
// Staging Graph Properties
// =============================================================================

fn staging_graph() -> impl Strategy<Value = StagingGraph> {
    (
        prop::collection::btree_map("[a-z]{1,4}", 0i64..5, 0..12),
        prop::collection::vec(("[a-z]{1,4}", "[a-z]{1,4}"), 0..10),
    )
        .prop_map(|(objects, edges)| {
            let mut staging = StagingGraph::new();
            for (local, value) in objects {
                let mut properties = BTreeMap::new();
                properties.insert("v".to_string(), json!(value));
                staging.put(&local, properties);
            }
            for (from, to) in edges {
                staging.relate(&from, &to);
            }
            staging
        })
}

fn hashes(staging: &StagingGraph) -> BTreeMap<String, String> {
    staging
        .iter()
        .map(|(local, object)| (local.clone(), object.content_hash()))
        .collect()
}

proptest! {
    /// Running the same content twice changes nothing.
    #[test]
    fn diff_against_itself_is_empty(staging in staging_graph()) {
        prop_assert!(staging.diff(&hashes(&staging)).is_empty());
    }

    /// Applying a diff's outcome leaves nothing further to apply.
    #[test]
    fn diff_then_apply_converges(before in staging_graph(), after in staging_graph()) {
        let changes = after.diff(&hashes(&before));
        let mut current = hashes(&before);
        for local in &changes.deleted {
            current.remove(local);
        }
        for (local, object) in after.iter() {
            current.insert(local.clone(), object.content_hash());
        }
        prop_assert!(after.diff(&current).is_empty());
        prop_assert!(changes.len() <= before.len() + after.len());
    }
}

// =============================================================================
// Wire Robustness
// =============================================================================

proptest! {
    /// Garbage never panics the decoder.
    #[test]
    fn decode_message_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode_message(&bytes);
    }
}
