//! Retrieval scoring and decay tiers.
//!
//! These are code-level policy functions, not stored state: tuning a weight
//! here affects every entry immediately, and `decay_tier` is always derived
//! from the row's timestamps at read time.

use chrono::{DateTime, Utc};

use crate::config::ChainConfig;
use crate::index::IndexRow;

/// Weight of the recency component in the composite score.
const RECENCY_WEIGHT: f64 = 0.30;
/// Weight of the normalized access count.
const ACCESS_WEIGHT: f64 = 0.40;
/// Weight of the writer-assigned importance.
const IMPORTANCE_WEIGHT: f64 = 0.30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayTier {
    Hot,
    Warm,
    Cold,
}

impl DecayTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecayTier::Hot => "hot",
            DecayTier::Warm => "warm",
            DecayTier::Cold => "cold",
        }
    }
}

/// Days since the entry was last created-or-accessed. A touch resets the
/// base, so accessed memories reheat.
pub fn age_days(
    created_at: DateTime<Utc>,
    last_accessed: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> f64 {
    let base = match last_accessed {
        Some(accessed) if accessed > created_at => accessed,
        _ => created_at,
    };
    (now - base).num_seconds().max(0) as f64 / 86_400.0
}

pub fn decay_tier(
    created_at: DateTime<Utc>,
    last_accessed: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &ChainConfig,
) -> DecayTier {
    let age = age_days(created_at, last_accessed, now);
    if age <= config.decay_hot_days {
        DecayTier::Hot
    } else if age <= config.decay_warm_days {
        DecayTier::Warm
    } else {
        DecayTier::Cold
    }
}

/// Exponential recency: 1.0 at age zero, halving-ish per half-life.
pub fn recency(age_days: f64, half_life_days: f64) -> f64 {
    (-age_days / half_life_days).exp()
}

/// Access normalization: n / (1 + n), bounded in [0, 1).
pub fn access_norm(access_count: i64) -> f64 {
    let n = access_count.max(0) as f64;
    n / (1.0 + n)
}

/// Default lexical ranker: case-insensitive query-token overlap. Doubles as
/// the boolean predicate for retrieval — zero overlap with a non-empty query
/// drops the candidate.
pub fn lexical_overlap(query: &str, content: &str) -> f64 {
    let content = content.to_lowercase();
    let tokens: Vec<&str> = query.split_whitespace().collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let matched = tokens
        .iter()
        .filter(|t| content.contains(t.to_lowercase().as_str()))
        .count();
    matched as f64 / tokens.len() as f64
}

/// Composite retrieval score for one candidate row.
pub fn composite(row: &IndexRow, lex: f64, now: DateTime<Utc>, config: &ChainConfig) -> f64 {
    let age = age_days(row.created_at, row.last_accessed, now);
    RECENCY_WEIGHT * recency(age, config.recall_half_life_days)
        + ACCESS_WEIGHT * access_norm(row.access_count)
        + IMPORTANCE_WEIGHT * row.importance.clamp(0.0, 1.0)
        + lex
}

/// Rough token estimate used for recall budgets: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}
