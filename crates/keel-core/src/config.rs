//! Chain configuration.
//!
//! Everything has a fixed default; in practice only the token budget and the
//! lexical ranker vary across deployments. The canonicalization form (NFC)
//! and the signature algorithm (Ed25519) are design commitments, not knobs.

use crate::score;

/// A pluggable lexical scorer: `(query, content) → score`. Anything at or
/// below zero excludes the candidate when the query is non-empty.
pub type LexicalRanker = dyn Fn(&str, &str) -> f64 + Send + Sync;

pub struct ChainConfig {
    /// Recall token budget when the caller does not pass one.
    pub max_tokens_default: usize,
    /// Half-life of the recency score component, in days.
    pub recall_half_life_days: f64,
    /// Upper age bound of the `hot` decay tier, in days.
    pub decay_hot_days: f64,
    /// Upper age bound of the `warm` decay tier, in days.
    pub decay_warm_days: f64,
    /// Lexical scorer used by recall.
    pub lexical_ranker: Box<LexicalRanker>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_tokens_default: 2048,
            recall_half_life_days: 7.0,
            decay_hot_days: 7.0,
            decay_warm_days: 30.0,
            lexical_ranker: Box::new(score::lexical_overlap),
        }
    }
}

impl std::fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainConfig")
            .field("max_tokens_default", &self.max_tokens_default)
            .field("recall_half_life_days", &self.recall_half_life_days)
            .field("decay_hot_days", &self.decay_hot_days)
            .field("decay_warm_days", &self.decay_warm_days)
            .finish_non_exhaustive()
    }
}
