//! Sparse named features for merge decisions.
//!
//! Features are (name, value) pairs so a warm-started model can pin weights
//! to stable names ("rank", "anaph", ...) before any training pass.

use crate::config::ScoreSource;
use crate::document::{MentionPair, ScoredDocument};
use std::collections::{BTreeMap, HashSet};

/// A sparse feature vector with named dimensions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureVector {
    feats: Vec<(String, f64)>,
}

impl FeatureVector {
    /// Create an empty feature vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a feature.
    pub fn push(&mut self, name: impl Into<String>, value: f64) {
        self.feats.push((name.into(), value));
    }

    /// Iterate over (name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.feats.iter().map(|(n, v)| (n.as_str(), *v))
    }

    /// Number of features.
    #[must_use]
    pub fn len(&self) -> usize {
        self.feats.len()
    }

    /// Whether the vector has no features.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.feats.is_empty()
    }
}

/// `a - b` as a sparse vector, with dimensions in stable name order.
#[must_use]
pub fn feature_diff(a: &FeatureVector, b: &FeatureVector) -> FeatureVector {
    let mut merged: BTreeMap<&str, f64> = BTreeMap::new();
    for (name, value) in a.iter() {
        *merged.entry(name).or_insert(0.0) += value;
    }
    for (name, value) in b.iter() {
        *merged.entry(name).or_insert(0.0) -= value;
    }
    let mut diff = FeatureVector::new();
    for (name, value) in merged {
        if value != 0.0 {
            diff.push(name, value);
        }
    }
    diff
}

/// Per-position scalars precomputed once per state.
///
/// Candidate pairs are processed in a fixed order, so everything derivable
/// from the pair sequence alone is computed up front rather than per rollout.
#[derive(Debug, Clone)]
pub struct GlobalFeatures {
    /// Whether the pair's anaphor already appeared as the anaphor of an
    /// earlier candidate pair.
    anaphor_seen: Vec<bool>,
    /// Pair index as a fraction of the candidate sequence length.
    position: Vec<f64>,
    /// Bucketed mention count of the document.
    size_bucket: usize,
}

impl GlobalFeatures {
    /// Precompute scalars for a candidate-pair sequence.
    #[must_use]
    pub fn build(pairs: &[MentionPair], mention_count: usize) -> Self {
        let mut seen = HashSet::new();
        let mut anaphor_seen = Vec::with_capacity(pairs.len());
        let mut position = Vec::with_capacity(pairs.len());
        let count = pairs.len().max(1) as f64;
        for (idx, &(_, anaphor)) in pairs.iter().enumerate() {
            anaphor_seen.push(!seen.insert(anaphor));
            position.push(idx as f64 / count);
        }
        Self {
            anaphor_seen,
            position,
            size_bucket: size_bucket(mention_count),
        }
    }

    /// Whether the anaphor at `index` was seen earlier in the sequence.
    #[must_use]
    pub fn anaphor_seen(&self, index: usize) -> bool {
        self.anaphor_seen.get(index).copied().unwrap_or(false)
    }

    /// Position fraction of `index`.
    #[must_use]
    pub fn position(&self, index: usize) -> f64 {
        self.position.get(index).copied().unwrap_or(1.0)
    }

    /// Document-size bucket.
    #[must_use]
    pub fn size_bucket(&self) -> usize {
        self.size_bucket
    }
}

fn size_bucket(mention_count: usize) -> usize {
    match mention_count {
        0..=9 => 0,
        10..=24 => 1,
        25..=49 => 2,
        50..=99 => 3,
        100..=249 => 4,
        _ => 5,
    }
}

/// Assemble the feature vector for the merge decision at one candidate pair.
#[must_use]
pub fn pair_features(
    doc: &ScoredDocument,
    pair: MentionPair,
    index: usize,
    source: ScoreSource,
    globals: &GlobalFeatures,
) -> FeatureVector {
    let (antecedent, anaphor) = pair;
    let mut features = FeatureVector::new();
    features.push("bias", 1.0);

    if let Some(&score) = doc.classification.get(&pair) {
        features.push("cls", score);
    }
    if let Some(&score) = doc.ranking.get(&pair) {
        features.push("rank", score);
    }
    if let Some(anaphoricity) = &doc.anaphoricity {
        if let Some(&score) = anaphoricity.get(&anaphor) {
            features.push("anaph", score);
        }
    }
    if globals.anaphor_seen(index) {
        features.push("seen", 1.0);
    }
    features.push("pos", globals.position(index));
    features.push(
        format!(
            "kinds={}|{}",
            doc.kind(antecedent).as_label(),
            doc.kind(anaphor).as_label()
        ),
        1.0,
    );
    features.push(format!("docsize={}", globals.size_bucket()), 1.0);

    // The driving table also appears under its own name, so its weight can
    // move independently of the shared "cls"/"rank" dimensions.
    if let Some(&score) = doc.scores(source).get(&pair) {
        features.push("drive", score);
    }

    features
}
