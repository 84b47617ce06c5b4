//! External document interface.
//!
//! Linguistic processing (mention detection, parsing, lexical features) is a
//! collaborator concern; the engine only sees mention ids, pairwise score
//! tables, optional anaphoricity scores, mention kinds, and (for training)
//! gold clusters.

use crate::config::ScoreSource;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier of a mention within a document.
pub type MentionId = usize;

/// An (antecedent, anaphor) pair of mention ids.
pub type MentionPair = (MentionId, MentionId);

/// Kind of referring expression, as labelled by the mention detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MentionKind {
    /// Proper name ("Marie Curie").
    Proper,
    /// Common noun phrase ("the physicist").
    Nominal,
    /// Pronoun ("she").
    Pronoun,
    /// Unknown/unspecified.
    Unknown,
}

impl MentionKind {
    /// Short stable label used in feature names.
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            MentionKind::Proper => "proper",
            MentionKind::Nominal => "nominal",
            MentionKind::Pronoun => "pronoun",
            MentionKind::Unknown => "unknown",
        }
    }
}

/// A document as seen by the clustering engine.
///
/// Mentions appear in document order. Score tables are keyed by
/// (antecedent, anaphor) pairs; pairs absent from a table are unscored and
/// never become merge candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredDocument {
    /// Document identifier, folded into cache keys to prevent
    /// cross-document collisions.
    pub id: u64,
    /// Ordered mention ids.
    pub mentions: Vec<MentionId>,
    /// Pairwise classification scores.
    pub classification: HashMap<MentionPair, f64>,
    /// Pairwise ranking scores.
    pub ranking: HashMap<MentionPair, f64>,
    /// Optional per-mention anaphoricity scores.
    pub anaphoricity: Option<HashMap<MentionId, f64>>,
    /// Mention kind labels. Mentions absent from the map are `Unknown`.
    pub mention_kinds: HashMap<MentionId, MentionKind>,
    /// Gold clusters; present only for training/evaluation documents.
    pub gold: Option<Vec<Vec<MentionId>>>,
}

impl ScoredDocument {
    /// Create a document with mentions and no scores.
    #[must_use]
    pub fn new(id: u64, mentions: Vec<MentionId>) -> Self {
        Self {
            id,
            mentions,
            classification: HashMap::new(),
            ranking: HashMap::new(),
            anaphoricity: None,
            mention_kinds: HashMap::new(),
            gold: None,
        }
    }

    /// Set ranking scores.
    #[must_use]
    pub fn with_ranking(mut self, scores: HashMap<MentionPair, f64>) -> Self {
        self.ranking = scores;
        self
    }

    /// Set classification scores.
    #[must_use]
    pub fn with_classification(mut self, scores: HashMap<MentionPair, f64>) -> Self {
        self.classification = scores;
        self
    }

    /// Set anaphoricity scores.
    #[must_use]
    pub fn with_anaphoricity(mut self, scores: HashMap<MentionId, f64>) -> Self {
        self.anaphoricity = Some(scores);
        self
    }

    /// Set mention kinds.
    #[must_use]
    pub fn with_mention_kinds(mut self, kinds: HashMap<MentionId, MentionKind>) -> Self {
        self.mention_kinds = kinds;
        self
    }

    /// Set gold clusters.
    #[must_use]
    pub fn with_gold(mut self, gold: Vec<Vec<MentionId>>) -> Self {
        self.gold = Some(gold);
        self
    }

    /// The score table selected by `source`.
    #[must_use]
    pub fn scores(&self, source: ScoreSource) -> &HashMap<MentionPair, f64> {
        match source {
            ScoreSource::Ranking => &self.ranking,
            ScoreSource::Classification => &self.classification,
        }
    }

    /// Kind of a mention, defaulting to `Unknown`.
    #[must_use]
    pub fn kind(&self, mention: MentionId) -> MentionKind {
        self.mention_kinds
            .get(&mention)
            .copied()
            .unwrap_or(MentionKind::Unknown)
    }

    /// Mention to gold-cluster-index map, if gold clusters are present.
    #[must_use]
    pub fn gold_map(&self) -> Option<HashMap<MentionId, usize>> {
        let gold = self.gold.as_ref()?;
        let mut map = HashMap::new();
        for (idx, cluster) in gold.iter().enumerate() {
            for &mention in cluster {
                map.insert(mention, idx);
            }
        }
        Some(map)
    }
}
