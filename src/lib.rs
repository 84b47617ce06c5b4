//! # agglo
//!
//! Incremental agglomerative clustering for coreference resolution.
//!
//! - **Clustering**: a per-document decision state machine walks scored
//!   mention pairs in order, greedily merging clusters
//! - **Training**: SEARN-style imitation learning over rollout regret,
//!   regenerating its own training distribution each iteration
//! - **Evaluation**: B3 and MUC metrics with a weighted combination
//!
//! Linguistic processing stays outside the crate: collaborators hand over
//! mention ids, pairwise score tables, optional anaphoricity scores, mention
//! kinds, and (for training) gold clusters. The engine hands back merge
//! instructions.
//!
//! ## Quick Start: Inference
//!
//! ```rust
//! use agglo::{CancelToken, ClusterConfig, Clusterer, LinearScorer, ScoredDocument};
//!
//! let doc = ScoredDocument::new(1, vec![0, 1, 2, 3]).with_ranking(
//!     [((0, 1), 0.9), ((1, 2), 0.1), ((2, 3), 0.05)]
//!         .into_iter()
//!         .collect(),
//! );
//!
//! // Merge whenever the driving pair score clears 0.5.
//! let mut scorer = LinearScorer::default();
//! scorer.set_weight("drive", 1.0);
//! scorer.set_weight("bias", -0.5);
//!
//! let clusterer = Clusterer::with_scorer(ClusterConfig::default(), scorer);
//! let merges = clusterer.cluster_merges(&doc, &CancelToken::new())?;
//! assert_eq!(merges, vec![(0, 1)]);
//! # Ok::<(), agglo::Error>(())
//! ```
//!
//! ## Training
//!
//! ```rust,ignore
//! use agglo::{ClusterConfig, Clusterer, TrainConfig};
//!
//! let mut clusterer = Clusterer::new(ClusterConfig::default());
//! let report = clusterer.train(&train_docs, &heldout_docs,
//!     &TrainConfig::default(), checkpoint_dir)?;
//! println!("best heldout B3 F1: {:.1}%", report.best_score * 100.0);
//! ```
//!
//! ## Design Notes
//!
//! - **Caches are explicit**: feature, decision, and cost memoization live
//!   in run- and rollout-scoped objects with defined lifetimes, never in
//!   statics
//! - **Composition over inheritance**: any [`Scorer`] plugs into the engine;
//!   the learning step is a free function over candidate-action pairs
//! - **Deterministic**: a fixed seed reproduces document shuffles and
//!   mention hash assignment, and with them the training trajectory

#![warn(missing_docs)]

pub mod cluster;
pub mod config;
pub mod document;
mod engine;
mod error;
pub mod features;
pub mod metrics;
mod rng;
pub mod scorer;
pub mod state;

pub use config::{ClusterConfig, ScoreSource, TrainConfig};
pub use document::{MentionId, MentionKind, MentionPair, ScoredDocument};
pub use engine::{learn_from_pair, CancelToken, Clusterer, ProgressEntry, TrainReport};
pub use error::{Error, Result};
pub use metrics::{b3_score, combined_f1, evaluate, muc_score, EvalReport, MetricScores};
pub use scorer::{LinearScorer, Scorer};
pub use state::{CacheCounters, CandidateAction, MergeKey, RunContext, State};
