//! Clustering orchestration: greedy inference and imitation-learning training.
//!
//! Inference drives one [`State`] per document to completion and reports the
//! merges taken. Training regenerates its own training distribution each
//! iteration: rollouts mix expert and current-policy actions with a
//! geometrically decaying expert probability, so the example distribution
//! tracks the states the learned policy actually visits instead of the
//! states the expert would visit (covariate-shift correction).

use crate::cluster::MentionHasher;
use crate::config::{ClusterConfig, TrainConfig};
use crate::document::{MentionPair, ScoredDocument};
use crate::error::{Error, Result};
use crate::features::feature_diff;
use crate::metrics::b3_score;
use crate::rng::Prng;
use crate::scorer::{LinearScorer, Scorer};
use crate::state::{CandidateAction, RunContext, State};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative cancellation token.
///
/// Inference checks the token once per mention-pair decision; on signal the
/// current document is abandoned with [`Error::Cancelled`] and no partial
/// result.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an unsignalled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Training report
// =============================================================================

/// One held-out evaluation, matching a `progress.log` line.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEntry {
    /// Training iteration the evaluation ran after.
    pub iteration: usize,
    /// Mean held-out B3 F1.
    pub score: f64,
    /// Seconds elapsed since training started.
    pub elapsed_secs: f64,
    /// Feature-cache hit rate so far.
    pub feature_hit_rate: f64,
    /// Decision-cache hit rate so far.
    pub decision_hit_rate: f64,
    /// Cost-cache hit rate so far.
    pub cost_hit_rate: f64,
}

/// Outcome of a training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    /// All held-out evaluations, in order.
    pub history: Vec<ProgressEntry>,
    /// Best held-out score seen.
    pub best_score: f64,
    /// Iteration the best score was reached at.
    pub best_iteration: usize,
}

// =============================================================================
// Learning step
// =============================================================================

/// One SGD step from a pair of candidate actions.
///
/// The lower-cost action is the better one; the pair is swapped first if the
/// nominal order disagrees, keeping the sign convention consistent. Learning
/// subtracts worse-action features from better-action features and steps
/// with weight equal to the worse action's cost, so larger regret drives a
/// larger update. Ties carry zero regret and are skipped.
pub fn learn_from_pair(scorer: &mut dyn Scorer, first: &CandidateAction, second: &CandidateAction) {
    let (better, worse) = if first.cost <= second.cost {
        (first, second)
    } else {
        (second, first)
    };
    if worse.cost == 0.0 {
        return;
    }
    let diff = feature_diff(&better.features, &worse.features);
    scorer.learn(&diff, 1.0, worse.cost);
}

// =============================================================================
// Clusterer
// =============================================================================

/// Default seed for mention hash assignment outside training runs.
const DEFAULT_HASH_SEED: u64 = 42;

/// Hand-picked warm-start weights. Training starts from a sane merge policy
/// driven by the collaborator's pairwise scores rather than from zero.
const WARM_START: &[(&str, f64)] = &[
    ("bias", -0.4),
    ("drive", 1.2),
    ("cls", 0.5),
    ("rank", 0.5),
    ("anaph", 0.25),
];

/// Orchestrates clustering inference and training for scored documents.
#[derive(Debug, Clone)]
pub struct Clusterer<S = LinearScorer> {
    config: ClusterConfig,
    scorer: S,
    hasher: MentionHasher,
}

impl Clusterer<LinearScorer> {
    /// Create a clusterer with an untrained linear scorer.
    #[must_use]
    pub fn new(config: ClusterConfig) -> Self {
        Self::with_scorer(config, LinearScorer::default())
    }
}

impl<S: Scorer> Clusterer<S> {
    /// Create a clusterer around an existing scorer.
    #[must_use]
    pub fn with_scorer(config: ClusterConfig, scorer: S) -> Self {
        Self {
            config,
            scorer,
            hasher: MentionHasher::new(DEFAULT_HASH_SEED),
        }
    }

    /// Set the mention-hash seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.hasher = MentionHasher::new(seed);
        self
    }

    /// The clustering configuration.
    #[must_use]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The scorer.
    #[must_use]
    pub fn scorer(&self) -> &S {
        &self.scorer
    }

    /// Mutable access to the scorer.
    pub fn scorer_mut(&mut self) -> &mut S {
        &mut self.scorer
    }

    /// Pure inference: drive one document's state to completion greedily and
    /// return the merges taken, in order, for the caller to apply to its own
    /// cluster bookkeeping.
    ///
    /// The cancel token is checked once per mention-pair decision; on signal
    /// the document aborts with [`Error::Cancelled`] and no partial result.
    pub fn cluster_merges(
        &self,
        doc: &ScoredDocument,
        cancel: &CancelToken,
    ) -> Result<Vec<MentionPair>> {
        let mut ctx = RunContext::evaluation();
        let mut state = State::new(doc, &self.config, self.hasher)?;
        while !state.is_complete() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            state.do_best_action(&self.scorer, &mut ctx)?;
        }
        Ok(state.merges().to_vec())
    }

    /// Roll out one document, collecting a (merge, no-merge) candidate pair
    /// at every decision point. The action actually taken is the expert's
    /// (lower rolled-out cost) with probability `beta`, the current policy's
    /// otherwise.
    fn rollout_examples(
        &self,
        doc: &ScoredDocument,
        beta: f64,
        ctx: &mut RunContext,
        rng: &mut Prng,
    ) -> Result<Vec<(CandidateAction, CandidateAction)>> {
        let mut state = State::new(doc, &self.config, self.hasher)?;
        let mut examples = Vec::new();
        while !state.is_complete() {
            let (merge_action, keep_action) = state.candidate_actions(&self.scorer, ctx)?;
            let expert_merge = merge_action.cost < keep_action.cost;
            let take_merge = if rng.next_f64() < beta {
                expert_merge
            } else {
                self.scorer.score(&merge_action.features) > 0.0
            };
            examples.push((merge_action, keep_action));
            state.do_action(take_merge)?;
        }
        Ok(examples)
    }

    /// Mean held-out B3 F1 under the current policy, via full greedy rollout.
    fn evaluate_heldout(&self, heldout: &[ScoredDocument]) -> Result<f64> {
        let mut ctx = RunContext::evaluation();
        let mut total = 0.0;
        for doc in heldout {
            let mut state = State::new(doc, &self.config, self.hasher)?;
            while !state.is_complete() {
                state.do_best_action(&self.scorer, &mut ctx)?;
            }
            let gold = doc.gold_map().ok_or_else(|| {
                Error::configuration(format!("held-out document {} has no gold clusters", doc.id))
            })?;
            total += b3_score(&state.partition(), &gold).f1;
        }
        Ok(total / heldout.len() as f64)
    }
}

impl Clusterer<LinearScorer> {
    /// Imitation-learning training loop.
    ///
    /// 1. Warm-start the scorer with a few hand-picked named weights.
    /// 2. Bootstrap one expert-guided example set per document.
    /// 3. Each iteration: cap the replay buffer to
    ///    `buffer_size_multiplier * |docs|` most-recent example sets, run an
    ///    SGD pass over the flattened shuffled buffer, evaluate and
    ///    checkpoint on schedule, then regenerate one example set per
    ///    document with expert probability `expert_decay^(iteration + 1)`.
    ///
    /// Checkpoints land under `checkpoint_dir`: `config.json` (once),
    /// `model-latest.json` / `model-best.json` / `model-iter-N.json`,
    /// `weights.tsv`, and an appended `progress.log` with one line per
    /// evaluation: iteration, score, elapsed seconds, and the three cache
    /// hit rates. Checkpoint failures are fatal and carry phase/file
    /// context; nothing is retried.
    pub fn train(
        &mut self,
        train_docs: &[ScoredDocument],
        heldout: &[ScoredDocument],
        train_config: &TrainConfig,
        checkpoint_dir: &Path,
    ) -> Result<TrainReport> {
        self.config.validate()?;
        train_config.validate()?;
        if train_docs.is_empty() {
            return Err(Error::configuration("no training documents"));
        }
        if heldout.is_empty() {
            return Err(Error::configuration("no held-out documents"));
        }
        for doc in train_docs {
            if doc.gold.is_none() {
                return Err(Error::configuration(format!(
                    "training document {} has no gold clusters",
                    doc.id
                )));
            }
        }

        std::fs::create_dir_all(checkpoint_dir)
            .map_err(|e| Error::checkpoint("create-dir", checkpoint_dir, e))?;
        self.save_config(train_config, checkpoint_dir)?;

        self.hasher = MentionHasher::new(train_config.seed);
        let mut rng = Prng::new(train_config.seed);
        let mut ctx = RunContext::training();
        let started = Instant::now();

        warm_start(&mut self.scorer);
        self.scorer.set_learning_rate(train_config.learning_rate);
        log::info!(
            "training on {} documents ({} held out), config {:?}",
            train_docs.len(),
            heldout.len(),
            train_config.describe()
        );

        // Bootstrap: the very first SGD pass needs examples, and the policy
        // has seen nothing yet, so the initial distribution is pure expert.
        let mut buffer: VecDeque<Vec<(CandidateAction, CandidateAction)>> = VecDeque::new();
        for doc in train_docs {
            buffer.push_back(self.rollout_examples(doc, 1.0, &mut ctx, &mut rng)?);
        }

        let mut report = TrainReport {
            history: Vec::new(),
            best_score: f64::NEG_INFINITY,
            best_iteration: 0,
        };

        for iteration in 0..train_config.retrain_iterations {
            let mut order: Vec<usize> = (0..train_docs.len()).collect();
            rng.shuffle(&mut order);

            let cap = train_config.buffer_size_multiplier * train_docs.len();
            while buffer.len() > cap {
                buffer.pop_front();
            }

            let mut flattened: Vec<&(CandidateAction, CandidateAction)> =
                buffer.iter().flatten().collect();
            rng.shuffle(&mut flattened);
            log::debug!(
                "iteration {}: {} example pairs from {} sets",
                iteration,
                flattened.len(),
                buffer.len()
            );
            for (first, second) in flattened.iter().map(|pair| (&pair.0, &pair.1)) {
                learn_from_pair(&mut self.scorer, first, second);
            }

            if iteration % train_config.eval_interval == 0 {
                let entry = self.evaluate_and_checkpoint(
                    iteration,
                    heldout,
                    train_config,
                    checkpoint_dir,
                    &started,
                    &ctx,
                    &mut report,
                )?;
                log::info!(
                    "iteration {}: heldout B3 F1 {:.4} (best {:.4} at {})",
                    iteration,
                    entry.score,
                    report.best_score,
                    report.best_iteration
                );
            }

            let beta = train_config.expert_decay.powi(iteration as i32 + 1);
            for &doc_idx in &order {
                let examples =
                    self.rollout_examples(&train_docs[doc_idx], beta, &mut ctx, &mut rng)?;
                buffer.push_back(examples);
            }
        }

        // Final state of the policy, so the last SGD pass is always scored.
        self.evaluate_and_checkpoint(
            train_config.retrain_iterations,
            heldout,
            train_config,
            checkpoint_dir,
            &started,
            &ctx,
            &mut report,
        )?;

        log::info!(
            "training done: best heldout B3 F1 {:.4} at iteration {}, {} features cached",
            report.best_score,
            report.best_iteration,
            ctx.cached_features()
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_and_checkpoint(
        &self,
        iteration: usize,
        heldout: &[ScoredDocument],
        train_config: &TrainConfig,
        dir: &Path,
        started: &Instant,
        ctx: &RunContext,
        report: &mut TrainReport,
    ) -> Result<ProgressEntry> {
        let score = self.evaluate_heldout(heldout)?;
        let entry = ProgressEntry {
            iteration,
            score,
            elapsed_secs: started.elapsed().as_secs_f64(),
            feature_hit_rate: ctx.counters.feature_hit_rate(),
            decision_hit_rate: ctx.counters.decision_hit_rate(),
            cost_hit_rate: ctx.counters.cost_hit_rate(),
        };
        self.append_progress(dir, &entry)?;

        self.save_model(dir.join("model-latest.json"))?;
        self.scorer.save_weights(&dir.join("weights.tsv"))?;
        if score > report.best_score {
            report.best_score = score;
            report.best_iteration = iteration;
            self.save_model(dir.join("model-best.json"))?;
        }
        if iteration % train_config.checkpoint_interval == 0 {
            self.save_model(dir.join(format!("model-iter-{iteration}.json")))?;
        }

        report.history.push(entry.clone());
        Ok(entry)
    }

    fn save_model(&self, path: PathBuf) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.scorer)
            .map_err(|e| Error::checkpoint("save-model", &path, e))?;
        let file = File::create(&path).map_err(|e| Error::checkpoint("save-model", &path, e))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(json.as_bytes())
            .and_then(|()| writer.flush())
            .map_err(|e| Error::checkpoint("save-model", &path, e))?;
        Ok(())
    }

    fn save_config(&self, train_config: &TrainConfig, dir: &Path) -> Result<()> {
        let path = dir.join("config.json");
        let mut dump = std::collections::BTreeMap::new();
        dump.insert("cluster", self.config.describe());
        dump.insert("train", train_config.describe());
        let json = serde_json::to_string_pretty(&dump)
            .map_err(|e| Error::checkpoint("save-config", &path, e))?;
        std::fs::write(&path, json).map_err(|e| Error::checkpoint("save-config", &path, e))?;
        Ok(())
    }

    fn append_progress(&self, dir: &Path, entry: &ProgressEntry) -> Result<()> {
        let path = dir.join("progress.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::checkpoint("append-progress", &path, e))?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "{}\t{:.6}\t{:.3}\t{:.4}\t{:.4}\t{:.4}",
            entry.iteration,
            entry.score,
            entry.elapsed_secs,
            entry.feature_hit_rate,
            entry.decision_hit_rate,
            entry.cost_hit_rate
        )
        .and_then(|()| writer.flush())
        .map_err(|e| Error::checkpoint("append-progress", &path, e))?;
        Ok(())
    }
}

/// Pin the warm-start weights on a fresh scorer.
fn warm_start(scorer: &mut LinearScorer) {
    for &(name, weight) in WARM_START {
        scorer.set_weight(name, weight);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn two_pair_doc(id: u64) -> ScoredDocument {
        let mut ranking: HashMap<MentionPair, f64> = HashMap::new();
        ranking.insert((0, 1), 0.9);
        ranking.insert((2, 3), 0.85);
        ranking.insert((1, 2), 0.1);
        ScoredDocument::new(id, vec![0, 1, 2, 3])
            .with_ranking(ranking)
            .with_gold(vec![vec![0, 1], vec![2, 3]])
    }

    fn merge_threshold_scorer(threshold: f64) -> LinearScorer {
        // score = drive - threshold, so merges happen iff drive > threshold.
        let mut scorer = LinearScorer::new(0.1);
        scorer.set_weight("drive", 1.0);
        scorer.set_weight("bias", -threshold);
        scorer
    }

    #[test]
    fn test_cluster_merges_returns_taken_merges() {
        let doc = two_pair_doc(1);
        let clusterer =
            Clusterer::with_scorer(ClusterConfig::default(), merge_threshold_scorer(0.5));
        let merges = clusterer.cluster_merges(&doc, &CancelToken::new()).unwrap();
        assert_eq!(merges, vec![(0, 1), (2, 3)]);
    }

    #[test]
    fn test_cancelled_inference_has_no_output() {
        let doc = two_pair_doc(1);
        let clusterer =
            Clusterer::with_scorer(ClusterConfig::default(), merge_threshold_scorer(0.5));
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            clusterer.cluster_merges(&doc, &cancel),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_learn_from_pair_swaps_misordered_pair() {
        let mut better_features = crate::features::FeatureVector::new();
        better_features.push("rank", 1.0);
        let better = CandidateAction {
            merge: true,
            features: better_features,
            cost: 0.0,
        };
        let worse = CandidateAction {
            merge: false,
            features: crate::features::FeatureVector::new(),
            cost: 0.5,
        };

        // Nominal order (worse, better): learn_from_pair must reorder and
        // still push the merge score up.
        let mut scorer = LinearScorer::new(1.0);
        learn_from_pair(&mut scorer, &worse, &better);
        assert!(scorer.weight("rank") > 0.0);
    }

    #[test]
    fn test_learn_from_pair_skips_zero_regret() {
        let action = CandidateAction {
            merge: true,
            features: crate::features::FeatureVector::new(),
            cost: 0.0,
        };
        let mut scorer = LinearScorer::new(1.0);
        learn_from_pair(&mut scorer, &action.clone(), &action);
        assert_eq!(scorer.dimension_count(), 0);
    }

    #[test]
    fn test_train_writes_checkpoints_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let docs = vec![two_pair_doc(1), two_pair_doc(2)];
        let heldout = vec![two_pair_doc(3)];

        let mut clusterer = Clusterer::new(ClusterConfig::default());
        let train_config = TrainConfig::default()
            .with_retrain_iterations(2)
            .with_seed(7);
        let report = clusterer
            .train(&docs, &heldout, &train_config, dir.path())
            .unwrap();

        assert!(!report.history.is_empty());
        assert!(report.best_score >= 0.0);
        for file in [
            "config.json",
            "model-latest.json",
            "model-best.json",
            "weights.tsv",
            "progress.log",
        ] {
            assert!(dir.path().join(file).exists(), "missing checkpoint {file}");
        }

        let progress = std::fs::read_to_string(dir.path().join("progress.log")).unwrap();
        let first_line = progress.lines().next().unwrap();
        assert_eq!(
            first_line.split('\t').count(),
            6,
            "progress schema: iteration, score, elapsed, three hit rates"
        );
    }

    #[test]
    fn test_train_requires_gold() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = two_pair_doc(1);
        doc.gold = None;
        let heldout = vec![two_pair_doc(2)];

        let mut clusterer = Clusterer::new(ClusterConfig::default());
        let result = clusterer.train(&[doc], &heldout, &TrainConfig::default(), dir.path());
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_train_improves_or_holds_heldout_score() {
        let dir = tempfile::tempdir().unwrap();
        let docs = vec![two_pair_doc(1), two_pair_doc(2), two_pair_doc(3)];
        let heldout = vec![two_pair_doc(4)];

        let mut clusterer = Clusterer::new(ClusterConfig::default());
        let train_config = TrainConfig::default().with_retrain_iterations(4);
        let report = clusterer
            .train(&docs, &heldout, &train_config, dir.path())
            .unwrap();

        let first = report.history.first().unwrap().score;
        assert!(
            report.best_score >= first,
            "best score {} cannot be below the first evaluation {}",
            report.best_score,
            first
        );
    }
}
