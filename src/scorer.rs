//! Linear scoring of merge decisions.
//!
//! The engine is agnostic to the model behind a decision: anything that can
//! score a sparse feature vector and take weighted online updates plugs in.
//! [`LinearScorer`] is the bundled implementation.

use crate::error::{Error, Result};
use crate::features::FeatureVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// An online linear model over sparse named features.
pub trait Scorer {
    /// Dot product of the model weights with `features`.
    fn score(&self, features: &FeatureVector) -> f64;

    /// Weighted update: move weights in the direction of `label` (+1/-1)
    /// scaled by `weight`.
    fn learn(&mut self, features: &FeatureVector, label: f64, weight: f64);
}

/// Online logistic model keyed by feature name.
///
/// `learn` takes a logistic gradient step, so repeated passes over the same
/// examples saturate instead of growing weights without bound. Weights live
/// in a `BTreeMap` so serialized checkpoints and weight dumps are stable
/// across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearScorer {
    weights: BTreeMap<String, f64>,
    learning_rate: f64,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl Default for LinearScorer {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl LinearScorer {
    /// Create an empty model with the given learning rate.
    #[must_use]
    pub fn new(learning_rate: f64) -> Self {
        Self {
            weights: BTreeMap::new(),
            learning_rate,
        }
    }

    /// Pin a named weight. Used for warm starts.
    pub fn set_weight(&mut self, name: impl Into<String>, weight: f64) {
        self.weights.insert(name.into(), weight);
    }

    /// Change the learning rate.
    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    /// Current weight of a feature (0 if unseen).
    #[must_use]
    pub fn weight(&self, name: &str) -> f64 {
        self.weights.get(name).copied().unwrap_or(0.0)
    }

    /// Number of non-zero dimensions.
    #[must_use]
    pub fn dimension_count(&self) -> usize {
        self.weights.len()
    }

    /// The `n` largest weights by magnitude, for diagnostics.
    #[must_use]
    pub fn top_weights(&self, n: usize) -> Vec<(&str, f64)> {
        let mut entries: Vec<(&str, f64)> = self
            .weights
            .iter()
            .map(|(name, &w)| (name.as_str(), w))
            .collect();
        entries.sort_by(|a, b| {
            b.1.abs()
                .partial_cmp(&a.1.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        entries.truncate(n);
        entries
    }

    /// Write weights as `name\tweight` lines.
    ///
    /// The writer is scoped so the file is flushed and closed on every exit
    /// path; a failed write surfaces as a checkpoint error.
    pub fn save_weights(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| Error::checkpoint("save-weights", path, e))?;
        let mut writer = BufWriter::new(file);
        for (name, weight) in &self.weights {
            writeln!(writer, "{}\t{}", name, weight)
                .map_err(|e| Error::checkpoint("save-weights", path, e))?;
        }
        writer
            .flush()
            .map_err(|e| Error::checkpoint("save-weights", path, e))?;
        Ok(())
    }

    /// Read weights written by [`save_weights`](Self::save_weights).
    pub fn load_weights(path: &Path, learning_rate: f64) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::checkpoint("load-weights", path, e))?;
        let reader = BufReader::new(file);
        let mut weights = BTreeMap::new();
        for line in reader.lines() {
            let line = line.map_err(|e| Error::checkpoint("load-weights", path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let (name, value) = line.split_once('\t').ok_or_else(|| {
                Error::checkpoint("load-weights", path, format!("malformed line: {line:?}"))
            })?;
            let value: f64 = value.parse().map_err(|e| {
                Error::checkpoint("load-weights", path, format!("bad weight {value:?}: {e}"))
            })?;
            weights.insert(name.to_string(), value);
        }
        Ok(Self {
            weights,
            learning_rate,
        })
    }
}

impl Scorer for LinearScorer {
    fn score(&self, features: &FeatureVector) -> f64 {
        features
            .iter()
            .map(|(name, value)| self.weight(name) * value)
            .sum()
    }

    fn learn(&mut self, features: &FeatureVector, label: f64, weight: f64) {
        if weight == 0.0 {
            return;
        }
        let target = if label > 0.0 { 1.0 } else { 0.0 };
        let predicted = sigmoid(self.score(features));
        let step = self.learning_rate * weight * (target - predicted);
        for (name, value) in features.iter() {
            *self.weights.entry(name.to_string()).or_insert(0.0) += step * value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(entries: &[(&str, f64)]) -> FeatureVector {
        let mut v = FeatureVector::new();
        for (name, value) in entries {
            v.push(*name, *value);
        }
        v
    }

    #[test]
    fn test_score_is_dot_product() {
        let mut scorer = LinearScorer::new(0.1);
        scorer.set_weight("rank", 2.0);
        scorer.set_weight("bias", -0.5);

        let features = vector(&[("rank", 0.9), ("bias", 1.0)]);
        assert!((scorer.score(&features) - 1.3).abs() < 1e-12);
    }

    #[test]
    fn test_learn_moves_score_toward_label() {
        let mut scorer = LinearScorer::new(0.5);
        let features = vector(&[("rank", 1.0)]);

        let before = scorer.score(&features);
        scorer.learn(&features, 1.0, 0.8);
        let after_up = scorer.score(&features);
        assert!(after_up > before, "positive update must raise the score");

        scorer.learn(&features, -1.0, 0.8);
        let after_down = scorer.score(&features);
        assert!(after_down < after_up, "negative update must lower the score");
    }

    #[test]
    fn test_repeated_updates_saturate() {
        let mut scorer = LinearScorer::new(1.0);
        let features = vector(&[("rank", 1.0)]);
        for _ in 0..1000 {
            scorer.learn(&features, 1.0, 1.0);
        }
        let before = scorer.score(&features);
        scorer.learn(&features, 1.0, 1.0);
        let delta = scorer.score(&features) - before;
        assert!(delta < 1e-2, "logistic step must shrink once satisfied: {delta}");
    }

    #[test]
    fn test_zero_weight_update_is_noop() {
        let mut scorer = LinearScorer::new(0.5);
        scorer.learn(&vector(&[("rank", 1.0)]), 1.0, 0.0);
        assert_eq!(scorer.dimension_count(), 0);
    }

    #[test]
    fn test_top_weights_ordered_by_magnitude() {
        let mut scorer = LinearScorer::new(0.1);
        scorer.set_weight("small", 0.1);
        scorer.set_weight("negative", -3.0);
        scorer.set_weight("large", 2.0);

        let top = scorer.top_weights(2);
        assert_eq!(top[0].0, "negative");
        assert_eq!(top[1].0, "large");
    }

    #[test]
    fn test_weights_roundtrip_via_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.tsv");

        let mut scorer = LinearScorer::new(0.1);
        scorer.set_weight("rank", 1.5);
        scorer.set_weight("kinds=pronoun|proper", -0.25);
        scorer.save_weights(&path).unwrap();

        let loaded = LinearScorer::load_weights(&path, 0.1).unwrap();
        assert_eq!(loaded.weight("rank"), 1.5);
        assert_eq!(loaded.weight("kinds=pronoun|proper"), -0.25);
    }

    #[test]
    fn test_load_rejects_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.tsv");
        std::fs::write(&path, "rank no-tab-here\n").unwrap();
        assert!(LinearScorer::load_weights(&path, 0.1).is_err());
    }
}
