//! Per-document clustering state machine.
//!
//! A [`State`] walks an ordered sequence of candidate mention pairs, deciding
//! at each position whether to merge the two clusters the pair currently
//! belongs to. Decisions are inherently sequential: every decision depends on
//! the partition produced by the previous ones.
//!
//! Three caches keep rollout-based training tractable:
//!
//! - a run-wide feature cache ([`RunContext`]) keyed by [`MergeKey`],
//!   amortizing feature assembly across rollouts of the same document;
//! - a per-rollout decision cache (`MergeKey` -> merge bool), so replayed
//!   decision points skip scoring entirely;
//! - a per-rollout cost cache keyed by the partition hash: identical final
//!   partitions yield identical scores regardless of the path taken.

use crate::cluster::{Cluster, MentionHasher};
use crate::config::ClusterConfig;
use crate::document::{MentionId, MentionPair, ScoredDocument};
use crate::error::{Error, Result};
use crate::features::{pair_features, FeatureVector, GlobalFeatures};
use crate::metrics::combined_f1;
use crate::rng::mix64;
use crate::scorer::Scorer;
use std::collections::{HashMap, HashSet};

// =============================================================================
// MergeKey
// =============================================================================

/// Cache key identifying one decision point.
///
/// Combines both cluster hashes with the cursor position and the document id;
/// the document id prevents cross-document collisions when a cache outlives
/// a single document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MergeKey {
    left: u64,
    right: u64,
    cursor: usize,
    doc: u64,
}

impl MergeKey {
    /// Create a key from cluster hashes, cursor, and document id.
    #[must_use]
    pub fn new(left: u64, right: u64, cursor: usize, doc: u64) -> Self {
        Self {
            left,
            right,
            cursor,
            doc,
        }
    }
}

// =============================================================================
// CandidateAction
// =============================================================================

/// A possible action at a decision point, with its rolled-out regret.
///
/// Ephemeral: built during training rollouts and consumed by the learner.
/// The better of the two actions at a point has cost 0; the other carries
/// the loss difference.
#[derive(Debug, Clone)]
pub struct CandidateAction {
    /// Whether this action merges the current pair.
    pub merge: bool,
    /// Decision-point features. The no-merge action is featureless, so the
    /// merge decision reduces to `score(features) > 0`.
    pub features: FeatureVector,
    /// Regret: extra clustering loss incurred by taking this action and
    /// completing optimally, scaled by `mention_count / 100`.
    pub cost: f64,
}

// =============================================================================
// RunContext
// =============================================================================

/// Cache hit/miss counters for the three memoization layers.
///
/// Counters only advance in training mode so evaluation passes do not
/// pollute training diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheCounters {
    /// Feature-cache hits.
    pub feature_hits: u64,
    /// Feature-cache misses.
    pub feature_misses: u64,
    /// Decision-cache hits.
    pub decision_hits: u64,
    /// Decision-cache misses.
    pub decision_misses: u64,
    /// Cost-cache hits.
    pub cost_hits: u64,
    /// Cost-cache misses.
    pub cost_misses: u64,
}

impl CacheCounters {
    fn ratio(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Feature-cache hit rate (0 when unused).
    #[must_use]
    pub fn feature_hit_rate(&self) -> f64 {
        Self::ratio(self.feature_hits, self.feature_misses)
    }

    /// Decision-cache hit rate (0 when unused).
    #[must_use]
    pub fn decision_hit_rate(&self) -> f64 {
        Self::ratio(self.decision_hits, self.decision_misses)
    }

    /// Cost-cache hit rate (0 when unused).
    #[must_use]
    pub fn cost_hit_rate(&self) -> f64 {
        Self::ratio(self.cost_hits, self.cost_misses)
    }
}

/// Run-scoped context threaded through rollouts.
///
/// Owns the feature cache and diagnostics counters that used to be global
/// state; constructing one per training run (and a separate one per
/// evaluation pass) bounds cache growth to the run's lifetime.
#[derive(Debug, Default)]
pub struct RunContext {
    /// Whether rollouts through this context are training rollouts.
    pub is_training: bool,
    /// Cache diagnostics.
    pub counters: CacheCounters,
    features: HashMap<MergeKey, FeatureVector>,
}

impl RunContext {
    /// Context for training rollouts (counters active).
    #[must_use]
    pub fn training() -> Self {
        Self {
            is_training: true,
            ..Self::default()
        }
    }

    /// Context for evaluation/inference passes (counters frozen).
    #[must_use]
    pub fn evaluation() -> Self {
        Self::default()
    }

    /// Number of cached feature vectors.
    #[must_use]
    pub fn cached_features(&self) -> usize {
        self.features.len()
    }

    fn features_for(
        &mut self,
        key: MergeKey,
        doc: &ScoredDocument,
        pair: MentionPair,
        index: usize,
        config: &ClusterConfig,
        globals: &GlobalFeatures,
    ) -> FeatureVector {
        if let Some(features) = self.features.get(&key) {
            if self.is_training {
                self.counters.feature_hits += 1;
            }
            return features.clone();
        }
        if self.is_training {
            self.counters.feature_misses += 1;
        }
        let features = pair_features(doc, pair, index, config.score_source, globals);
        self.features.insert(key, features.clone());
        features
    }
}

// =============================================================================
// State
// =============================================================================

/// Snapshot of one document's clustering in progress.
///
/// Created per document per rollout or inference call and discarded when the
/// candidate queue is exhausted. Cloning a state forks the partition and the
/// per-rollout caches, which is how hypothetical child states are built.
#[derive(Debug, Clone)]
pub struct State<'a> {
    doc: &'a ScoredDocument,
    config: &'a ClusterConfig,
    pairs: Vec<MentionPair>,
    globals: GlobalFeatures,
    clusters: Vec<Option<Cluster>>,
    owner: HashMap<MentionId, usize>,
    cursor: usize,
    state_hash: u64,
    merges: Vec<MentionPair>,
    merge_choices: HashMap<MergeKey, bool>,
    hashed_costs: HashMap<u64, f64>,
    gold: Option<HashMap<MentionId, usize>>,
}

impl<'a> State<'a> {
    /// Build the initial state: one singleton cluster per mention and the
    /// truncated candidate-pair sequence.
    ///
    /// Pairs come from the configured score table, ordered by score
    /// descending (ties broken by pair id). The sequence is cut off where
    /// either the score drops below `min_pairwise_score` with at least
    /// `min_pairs` already kept, or the index/score ratio exceeds
    /// `early_stop_val` past `early_stop_threshold`. Both heuristics bound
    /// compute against a long tail of low-confidence pairs.
    pub fn new(
        doc: &'a ScoredDocument,
        config: &'a ClusterConfig,
        hasher: MentionHasher,
    ) -> Result<Self> {
        if doc.mentions.is_empty() {
            return Err(Error::configuration(format!(
                "document {} has no mentions",
                doc.id
            )));
        }
        let mention_set: HashSet<MentionId> = doc.mentions.iter().copied().collect();
        if mention_set.len() != doc.mentions.len() {
            return Err(Error::configuration(format!(
                "document {} has duplicate mention ids",
                doc.id
            )));
        }

        let pairs = candidate_pairs(doc, config, &mention_set);
        let globals = GlobalFeatures::build(&pairs, doc.mentions.len());

        let mut clusters = Vec::with_capacity(doc.mentions.len());
        let mut owner = HashMap::with_capacity(doc.mentions.len());
        let mut state_hash = 0u64;
        for (slot, &mention) in doc.mentions.iter().enumerate() {
            let cluster = Cluster::singleton(mention, &hasher);
            state_hash ^= mix64(cluster.hash());
            owner.insert(mention, slot);
            clusters.push(Some(cluster));
        }

        Ok(Self {
            doc,
            config,
            pairs,
            globals,
            clusters,
            owner,
            cursor: 0,
            state_hash,
            merges: Vec::new(),
            merge_choices: HashMap::new(),
            hashed_costs: HashMap::new(),
            gold: doc.gold_map(),
        })
    }

    /// Whether the candidate queue is exhausted.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.cursor >= self.pairs.len()
    }

    /// The pair at the cursor, if any.
    #[must_use]
    pub fn current_pair(&self) -> Option<MentionPair> {
        self.pairs.get(self.cursor).copied()
    }

    /// Number of candidate pairs in the sequence.
    #[must_use]
    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Number of mentions in the document.
    #[must_use]
    pub fn mention_count(&self) -> usize {
        self.doc.mentions.len()
    }

    /// Hash of the current partition.
    #[must_use]
    pub fn partition_hash(&self) -> u64 {
        self.state_hash
    }

    /// Merges taken so far, in order.
    #[must_use]
    pub fn merges(&self) -> &[MentionPair] {
        &self.merges
    }

    /// Whether two mentions are currently in the same cluster.
    #[must_use]
    pub fn co_clustered(&self, a: MentionId, b: MentionId) -> bool {
        match (self.owner.get(&a), self.owner.get(&b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// The current partition as sorted mention lists.
    #[must_use]
    pub fn partition(&self) -> Vec<Vec<MentionId>> {
        let mut clusters: Vec<Vec<MentionId>> = self
            .clusters
            .iter()
            .flatten()
            .map(|c| {
                let mut mentions = c.mentions().to_vec();
                mentions.sort_unstable();
                mentions
            })
            .collect();
        clusters.sort_by_key(|c| c[0]);
        clusters
    }

    /// Cache key of the current decision point.
    pub fn merge_key(&self) -> Result<MergeKey> {
        let (a, b) = self
            .current_pair()
            .ok_or_else(|| Error::data_consistency("no candidate action at complete state"))?;
        let left = self.cluster_of(a)?;
        let right = self.cluster_of(b)?;
        Ok(MergeKey::new(
            left.hash(),
            right.hash(),
            self.cursor,
            self.doc.id,
        ))
    }

    fn cluster_of(&self, mention: MentionId) -> Result<&Cluster> {
        let slot = self
            .owner
            .get(&mention)
            .ok_or_else(|| Error::data_consistency(format!("mention {mention} has no cluster")))?;
        self.clusters[*slot]
            .as_ref()
            .ok_or_else(|| Error::data_consistency(format!("mention {mention} owned by dead slot")))
    }

    /// Apply a merge/no-merge decision at the cursor and advance.
    ///
    /// On merge the larger cluster absorbs the smaller (equal sizes: the
    /// lower slot absorbs), which bounds amortized merge cost and keeps the
    /// outcome deterministic. After advancing, the cursor skips every pair
    /// whose mentions are already co-clustered; a self-merge is vacuous and
    /// must never be offered as a decision.
    pub fn do_action(&mut self, merge: bool) -> Result<()> {
        let (a, b) = self
            .current_pair()
            .ok_or_else(|| Error::data_consistency("do_action on complete state"))?;

        if merge {
            let slot_a = *self
                .owner
                .get(&a)
                .ok_or_else(|| Error::data_consistency(format!("mention {a} has no cluster")))?;
            let slot_b = *self
                .owner
                .get(&b)
                .ok_or_else(|| Error::data_consistency(format!("mention {b} has no cluster")))?;
            if slot_a == slot_b {
                return Err(Error::data_consistency(format!(
                    "self-merge offered for pair ({a}, {b})"
                )));
            }

            let size_a = self.clusters[slot_a].as_ref().map_or(0, Cluster::size);
            let size_b = self.clusters[slot_b].as_ref().map_or(0, Cluster::size);
            let (winner, loser) = if size_a > size_b || (size_a == size_b && slot_a < slot_b) {
                (slot_a, slot_b)
            } else {
                (slot_b, slot_a)
            };

            let absorbed = self.clusters[loser]
                .take()
                .ok_or_else(|| Error::data_consistency("merge into dead slot"))?;
            for &mention in absorbed.mentions() {
                self.owner.insert(mention, winner);
            }
            let target = self.clusters[winner]
                .as_mut()
                .ok_or_else(|| Error::data_consistency("merge from dead slot"))?;
            // Roll the partition hash: out with both old clusters, in with
            // the merged one.
            self.state_hash ^= mix64(target.hash()) ^ mix64(absorbed.hash());
            target.merge(absorbed);
            let merged_hash = target.hash();
            self.state_hash ^= mix64(merged_hash);
            self.merges.push((a, b));
        }

        self.cursor += 1;
        while let Some((x, y)) = self.current_pair() {
            if !self.co_clustered(x, y) {
                break;
            }
            self.cursor += 1;
        }
        Ok(())
    }

    /// Greedy step: decide the current pair with the scorer and apply it.
    ///
    /// The decision is memoized by [`MergeKey`]; a replayed decision point
    /// applies the cached choice without recomputing features or scoring.
    pub fn do_best_action(&mut self, scorer: &dyn Scorer, ctx: &mut RunContext) -> Result<bool> {
        let key = self.merge_key()?;
        if let Some(&merge) = self.merge_choices.get(&key) {
            if ctx.is_training {
                ctx.counters.decision_hits += 1;
            }
            self.do_action(merge)?;
            return Ok(merge);
        }
        if ctx.is_training {
            ctx.counters.decision_misses += 1;
        }

        let pair = self
            .current_pair()
            .ok_or_else(|| Error::data_consistency("scoring a complete state"))?;
        let features =
            ctx.features_for(key, self.doc, pair, self.cursor, self.config, &self.globals);
        let merge = scorer.score(&features) > 0.0;
        self.merge_choices.insert(key, merge);
        self.do_action(merge)?;
        Ok(merge)
    }

    /// Clustering loss (1 - combined F1) of this state against gold.
    ///
    /// In exact-loss mode the state first rolls forward greedily to
    /// completion, and completed partitions are memoized by hash: identical
    /// final partitions yield identical scores regardless of path. With
    /// exact loss disabled (the default) the evaluator runs on the current
    /// partition directly on every call; the cost cache is still populated
    /// but never consulted.
    pub fn final_cost(&mut self, scorer: &dyn Scorer, ctx: &mut RunContext) -> Result<f64> {
        if self.config.exact_loss {
            while !self.is_complete() {
                self.do_best_action(scorer, ctx)?;
            }
            if let Some(&cost) = self.hashed_costs.get(&self.state_hash) {
                if ctx.is_training {
                    ctx.counters.cost_hits += 1;
                }
                return Ok(cost);
            }
        }
        if ctx.is_training {
            ctx.counters.cost_misses += 1;
        }
        let cost = {
            let gold = self.gold.as_ref().ok_or_else(|| {
                Error::configuration(format!("document {} has no gold clusters", self.doc.id))
            })?;
            1.0 - combined_f1(&self.partition(), gold, self.config.muc_weight)
        };
        self.hashed_costs.insert(self.state_hash, cost);
        Ok(cost)
    }

    /// The two candidate actions at the current decision point.
    ///
    /// Builds hypothetical merge and no-merge children, rolls each out to
    /// its final cost, and expresses the costs as regret: the better action
    /// gets 0, the other the loss difference, both scaled by
    /// `mention_count / 100`.
    pub fn candidate_actions(
        &self,
        scorer: &dyn Scorer,
        ctx: &mut RunContext,
    ) -> Result<(CandidateAction, CandidateAction)> {
        let key = self.merge_key()?;
        let pair = self
            .current_pair()
            .ok_or_else(|| Error::data_consistency("no candidate action at complete state"))?;
        let features =
            ctx.features_for(key, self.doc, pair, self.cursor, self.config, &self.globals);

        let mut merged_child = self.clone();
        merged_child.do_action(true)?;
        let mut kept_child = self.clone();
        kept_child.do_action(false)?;

        let scale = self.mention_count() as f64 / 100.0;
        let merge_loss = merged_child.final_cost(scorer, ctx)? * scale;
        let keep_loss = kept_child.final_cost(scorer, ctx)? * scale;
        let best = merge_loss.min(keep_loss);

        Ok((
            CandidateAction {
                merge: true,
                features,
                cost: merge_loss - best,
            },
            CandidateAction {
                merge: false,
                features: FeatureVector::new(),
                cost: keep_loss - best,
            },
        ))
    }
}

/// Ordered, truncated candidate pairs for a document.
fn candidate_pairs(
    doc: &ScoredDocument,
    config: &ClusterConfig,
    mentions: &HashSet<MentionId>,
) -> Vec<MentionPair> {
    let table = doc.scores(config.score_source);
    let mut scored: Vec<(MentionPair, f64)> = table
        .iter()
        .filter(|((a, b), score)| {
            a != b && mentions.contains(a) && mentions.contains(b) && !score.is_nan()
        })
        .map(|(&pair, &score)| (pair, score))
        .collect();
    scored.sort_by(|(pa, sa), (pb, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| pa.cmp(pb))
    });

    let mut pairs = Vec::new();
    for (idx, (pair, score)) in scored.into_iter().enumerate() {
        if score < config.min_pairwise_score && pairs.len() >= config.min_pairs {
            break;
        }
        let ratio = if score > 0.0 {
            idx as f64 / score
        } else {
            f64::INFINITY
        };
        if idx >= config.early_stop_threshold && ratio > config.early_stop_val {
            break;
        }
        pairs.push(pair);
    }
    pairs
}

// =============================================================================
// Tests
// =============================================================================
