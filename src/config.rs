//! Configuration for clustering and training.
//!
//! Both config types expose an explicit [`describe`](ClusterConfig::describe)
//! map for logging and for the persisted `config.json` checkpoint, so the
//! exact setup of a run is always recoverable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which score table drives candidate-pair ordering and truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreSource {
    /// Use the pairwise ranking table.
    Ranking,
    /// Use the pairwise classification table.
    Classification,
}

/// Configuration for the clustering state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Score table used to order and truncate candidate pairs.
    pub score_source: ScoreSource,
    /// Pairs scoring below this are dropped once `min_pairs` are included.
    pub min_pairwise_score: f64,
    /// Always keep at least this many candidate pairs regardless of score.
    pub min_pairs: usize,
    /// Index from which the index/score early-stop ratio is checked.
    pub early_stop_threshold: usize,
    /// Truncate once `index / score` exceeds this value.
    pub early_stop_val: f64,
    /// Weight of MUC F1 in the combined loss; B3 gets the complement.
    pub muc_weight: f64,
    /// Roll states to completion before costing them. When disabled the
    /// evaluator runs on the current partition directly.
    pub exact_loss: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            score_source: ScoreSource::Ranking,
            min_pairwise_score: 0.2,
            min_pairs: 10,
            early_stop_threshold: 1000,
            early_stop_val: 1000.0,
            muc_weight: 0.3,
            exact_loss: false,
        }
    }
}

impl ClusterConfig {
    /// Set the score source.
    #[must_use]
    pub fn with_score_source(mut self, source: ScoreSource) -> Self {
        self.score_source = source;
        self
    }

    /// Set the minimum pairwise score.
    #[must_use]
    pub fn with_min_pairwise_score(mut self, score: f64) -> Self {
        self.min_pairwise_score = score;
        self
    }

    /// Set the MUC weight of the combined loss.
    #[must_use]
    pub fn with_muc_weight(mut self, weight: f64) -> Self {
        self.muc_weight = weight;
        self
    }

    /// Enable or disable exact-loss rollouts.
    #[must_use]
    pub fn with_exact_loss(mut self, exact: bool) -> Self {
        self.exact_loss = exact;
        self
    }

    /// Validate threshold ranges.
    pub fn validate(&self) -> crate::Result<()> {
        if !(0.0..=1.0).contains(&self.muc_weight) {
            return Err(crate::Error::configuration(format!(
                "muc_weight must be in [0, 1], got {}",
                self.muc_weight
            )));
        }
        if self.early_stop_val <= 0.0 {
            return Err(crate::Error::configuration(format!(
                "early_stop_val must be positive, got {}",
                self.early_stop_val
            )));
        }
        Ok(())
    }

    /// Explicit key/value dump for logs and the config checkpoint.
    #[must_use]
    pub fn describe(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("score_source".into(), format!("{:?}", self.score_source));
        map.insert(
            "min_pairwise_score".into(),
            self.min_pairwise_score.to_string(),
        );
        map.insert("min_pairs".into(), self.min_pairs.to_string());
        map.insert(
            "early_stop_threshold".into(),
            self.early_stop_threshold.to_string(),
        );
        map.insert("early_stop_val".into(), self.early_stop_val.to_string());
        map.insert("muc_weight".into(), self.muc_weight.to_string());
        map.insert("exact_loss".into(), self.exact_loss.to_string());
        map
    }
}

/// Configuration for imitation-learning training runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Number of retraining iterations.
    pub retrain_iterations: usize,
    /// Replay buffer holds at most this many example sets per document.
    pub buffer_size_multiplier: usize,
    /// Expert-probability decay base; iteration i rolls out with
    /// `beta = expert_decay^(i + 1)`.
    pub expert_decay: f64,
    /// SGD step scale applied on top of per-example regret weights.
    pub learning_rate: f64,
    /// Evaluate on held-out data every this many iterations.
    pub eval_interval: usize,
    /// Write a periodic numbered model checkpoint every this many iterations.
    pub checkpoint_interval: usize,
    /// PRNG seed for document shuffles and mention hash assignment.
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            retrain_iterations: 5,
            buffer_size_multiplier: 20,
            expert_decay: 0.0,
            learning_rate: 0.1,
            eval_interval: 1,
            checkpoint_interval: 5,
            seed: 42,
        }
    }
}

impl TrainConfig {
    /// Set the number of retraining iterations.
    #[must_use]
    pub fn with_retrain_iterations(mut self, iterations: usize) -> Self {
        self.retrain_iterations = iterations;
        self
    }

    /// Set the expert decay base.
    #[must_use]
    pub fn with_expert_decay(mut self, decay: f64) -> Self {
        self.expert_decay = decay;
        self
    }

    /// Set the PRNG seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Validate ranges.
    pub fn validate(&self) -> crate::Result<()> {
        if self.retrain_iterations == 0 {
            return Err(crate::Error::configuration(
                "retrain_iterations must be at least 1",
            ));
        }
        if self.buffer_size_multiplier == 0 {
            return Err(crate::Error::configuration(
                "buffer_size_multiplier must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.expert_decay) {
            return Err(crate::Error::configuration(format!(
                "expert_decay must be in [0, 1], got {}",
                self.expert_decay
            )));
        }
        if self.eval_interval == 0 || self.checkpoint_interval == 0 {
            return Err(crate::Error::configuration(
                "eval_interval and checkpoint_interval must be at least 1",
            ));
        }
        Ok(())
    }

    /// Explicit key/value dump for logs and the config checkpoint.
    #[must_use]
    pub fn describe(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(
            "retrain_iterations".into(),
            self.retrain_iterations.to_string(),
        );
        map.insert(
            "buffer_size_multiplier".into(),
            self.buffer_size_multiplier.to_string(),
        );
        map.insert("expert_decay".into(), self.expert_decay.to_string());
        map.insert("learning_rate".into(), self.learning_rate.to_string());
        map.insert("eval_interval".into(), self.eval_interval.to_string());
        map.insert(
            "checkpoint_interval".into(),
            self.checkpoint_interval.to_string(),
        );
        map.insert("seed".into(), self.seed.to_string());
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ClusterConfig::default().validate().is_ok());
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bad_muc_weight_rejected() {
        let config = ClusterConfig::default().with_muc_weight(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let config = TrainConfig::default().with_retrain_iterations(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_describe_covers_fields() {
        let map = ClusterConfig::default().describe();
        assert!(map.contains_key("min_pairwise_score"));
        assert!(map.contains_key("exact_loss"));

        let map = TrainConfig::default().describe();
        assert!(map.contains_key("expert_decay"));
        assert!(map.contains_key("seed"));
    }
}
