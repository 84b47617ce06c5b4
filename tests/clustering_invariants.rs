//! Invariant tests for the clustering state machine.
//!
//! Covers:
//! - Order-independence of cluster membership hashes
//! - The partition invariant (every mention in exactly one cluster)
//! - The skip-ahead invariant (co-clustered pairs are never offered)
//! - Memoized decisions replaying without feature recomputation

use agglo::cluster::{Cluster, MentionHasher};
use agglo::{ClusterConfig, LinearScorer, MentionId, RunContext, ScoredDocument, State};
use std::collections::{HashMap, HashSet};

fn chain_doc(mentions: usize) -> ScoredDocument {
    // Adjacent pairs with slowly decaying scores, plus a few long-range
    // pairs so merges of merged clusters come up.
    let ids: Vec<MentionId> = (0..mentions).collect();
    let mut ranking = HashMap::new();
    for i in 0..mentions - 1 {
        ranking.insert((i, i + 1), 0.9 - 0.01 * i as f64);
    }
    for i in 0..mentions.saturating_sub(2) {
        ranking.insert((i, i + 2), 0.5 - 0.01 * i as f64);
    }
    ScoredDocument::new(11, ids.clone())
        .with_ranking(ranking)
        .with_gold(vec![ids])
}

// =============================================================================
// Hash commutativity
// =============================================================================

#[test]
fn merge_hash_is_commutative_for_all_pairs() {
    let hasher = MentionHasher::new(1234);
    for a in 0..12usize {
        for b in 0..12usize {
            if a == b {
                continue;
            }
            let mut ab = Cluster::singleton(a, &hasher);
            ab.merge(Cluster::singleton(b, &hasher));
            let mut ba = Cluster::singleton(b, &hasher);
            ba.merge(Cluster::singleton(a, &hasher));
            assert_eq!(ab.hash(), ba.hash(), "hash(merge({a},{b})) != hash(merge({b},{a}))");
        }
    }
}

#[test]
fn merge_hash_is_order_independent_for_cluster_pairs() {
    let hasher = MentionHasher::new(99);
    let mut left = Cluster::singleton(0, &hasher);
    left.merge(Cluster::singleton(1, &hasher));
    let mut right = Cluster::singleton(2, &hasher);
    right.merge(Cluster::singleton(3, &hasher));

    let mut lr = left.clone();
    lr.merge(right.clone());
    let mut rl = right;
    rl.merge(left);
    assert_eq!(lr.hash(), rl.hash());
}

// =============================================================================
// Partition and skip-ahead invariants
// =============================================================================

#[test]
fn partition_stays_disjoint_and_total_under_any_action_sequence() {
    let doc = chain_doc(10);
    let config = ClusterConfig::default();
    let all: HashSet<MentionId> = doc.mentions.iter().copied().collect();

    // Three deterministic action patterns exercise different merge shapes.
    for pattern in 0..3u64 {
        let mut state = State::new(&doc, &config, MentionHasher::new(42)).unwrap();
        let mut step = 0u64;
        while !state.is_complete() {
            let merge = (step + pattern) % (pattern + 2) == 0;
            state.do_action(merge).unwrap();
            step += 1;

            let partition = state.partition();
            let mut seen: HashSet<MentionId> = HashSet::new();
            for cluster in &partition {
                for &mention in cluster {
                    assert!(
                        seen.insert(mention),
                        "mention {mention} appears in two clusters (pattern {pattern})"
                    );
                }
            }
            assert_eq!(seen, all, "partition lost mentions (pattern {pattern})");
        }
    }
}

#[test]
fn cursor_never_rests_on_a_co_clustered_pair() {
    let doc = chain_doc(10);
    let config = ClusterConfig::default();
    let mut state = State::new(&doc, &config, MentionHasher::new(42)).unwrap();

    let mut step = 0;
    while !state.is_complete() {
        if let Some((a, b)) = state.current_pair() {
            assert!(
                !state.co_clustered(a, b),
                "pair ({a}, {b}) offered while co-clustered"
            );
        }
        state.do_action(step % 2 == 0).unwrap();
        step += 1;
    }
}

// =============================================================================
// Cache correctness
// =============================================================================

#[test]
fn shared_merge_keys_reuse_cached_features_across_rollouts() {
    let doc = chain_doc(8);
    let config = ClusterConfig::default();
    let mut scorer = LinearScorer::default();
    scorer.set_weight("drive", 1.0);
    scorer.set_weight("bias", -0.6);

    let mut ctx = RunContext::training();

    // Two independent rollouts of the same document visit the same initial
    // decision points; the second must hit the run-wide feature cache.
    let mut first = State::new(&doc, &config, MentionHasher::new(42)).unwrap();
    while !first.is_complete() {
        first.do_best_action(&scorer, &mut ctx).unwrap();
    }
    let misses_after_first = ctx.counters.feature_misses;
    assert!(misses_after_first > 0);
    assert_eq!(ctx.counters.feature_hits, 0);

    let mut second = State::new(&doc, &config, MentionHasher::new(42)).unwrap();
    while !second.is_complete() {
        second.do_best_action(&scorer, &mut ctx).unwrap();
    }
    assert_eq!(
        ctx.counters.feature_misses, misses_after_first,
        "identical decision points must not recompute features"
    );
    assert_eq!(ctx.counters.feature_hits, misses_after_first);
}

#[test]
fn identical_decision_points_get_identical_decisions() {
    let doc = chain_doc(8);
    let config = ClusterConfig::default();
    let mut scorer = LinearScorer::default();
    scorer.set_weight("drive", 1.0);
    scorer.set_weight("bias", -0.6);

    let mut ctx = RunContext::training();

    let mut first = State::new(&doc, &config, MentionHasher::new(42)).unwrap();
    let mut first_decisions = Vec::new();
    while !first.is_complete() {
        first_decisions.push(first.do_best_action(&scorer, &mut ctx).unwrap());
    }

    let mut second = State::new(&doc, &config, MentionHasher::new(42)).unwrap();
    let mut second_decisions = Vec::new();
    while !second.is_complete() {
        second_decisions.push(second.do_best_action(&scorer, &mut ctx).unwrap());
    }

    assert_eq!(first_decisions, second_decisions);
    assert_eq!(first.partition(), second.partition());
    assert_eq!(first.partition_hash(), second.partition_hash());
}
