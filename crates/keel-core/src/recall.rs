//! Ranked retrieval.
//!
//! Pipeline: index candidates → hydrate payloads from the content store →
//! lexical predicate + composite score → stable (score desc, seq desc)
//! order → token budget cut → touch every returned row.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::ChainConfig;
use crate::content::ContentStore;
use crate::entry::{EntryKind, Tier};
use crate::index::Index;
use crate::score::{self, DecayTier};
use crate::ChainError;

#[derive(Debug, Clone, Default)]
pub struct RecallOptions {
    /// Token budget; falls back to `ChainConfig::max_tokens_default`.
    pub max_tokens: Option<usize>,
    /// Result count cap on top of the token budget.
    pub max_results: Option<usize>,
    /// Restrict to these tiers when set.
    pub tiers: Option<Vec<Tier>>,
    /// Traverse past the supersession frontier.
    pub include_superseded: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RecallHit {
    pub seq: u64,
    pub content: String,
    pub score: f64,
    pub kind: EntryKind,
    pub tier: Tier,
    pub decay: DecayTier,
    pub is_superseded: bool,
}

pub fn recall(
    index: &Index,
    content: &ContentStore,
    config: &ChainConfig,
    query: &str,
    options: &RecallOptions,
    now: DateTime<Utc>,
) -> Result<Vec<RecallHit>, ChainError> {
    let mut rows = index.candidates(options.include_superseded)?;
    if let Some(tiers) = &options.tiers {
        rows.retain(|row| tiers.contains(&row.tier));
    }

    let filtering = !query.trim().is_empty();
    let mut hits: Vec<RecallHit> = Vec::new();
    for row in rows {
        let Some(text) = content.get(&row.content_hash)? else {
            warn!(seq = row.seq, "candidate payload missing from content store");
            continue;
        };
        let lex = (config.lexical_ranker)(query, &text);
        if filtering && lex <= 0.0 {
            continue;
        }
        hits.push(RecallHit {
            seq: row.seq,
            score: score::composite(&row, lex, now, config),
            decay: score::decay_tier(row.created_at, row.last_accessed, now, config),
            kind: row.kind,
            tier: row.tier,
            is_superseded: row.is_superseded,
            content: text,
        });
    }

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.seq.cmp(&a.seq))
    });
    if let Some(max) = options.max_results {
        hits.truncate(max);
    }

    // Token budget: keep ranked hits while the running estimate fits.
    let budget = options.max_tokens.unwrap_or(config.max_tokens_default);
    let mut spent = 0usize;
    let mut kept = Vec::new();
    for hit in hits {
        let cost = score::estimate_tokens(&hit.content);
        if spent + cost > budget {
            break;
        }
        spent += cost;
        kept.push(hit);
    }

    for hit in &kept {
        index.touch(hit.seq, now)?;
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Entry, Links, Provenance};

    fn fixture() -> (tempfile::TempDir, Index, ContentStore, ChainConfig) {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open_in_memory().unwrap();
        let content = ContentStore::open(dir.path()).unwrap();
        (dir, index, content, ChainConfig::default())
    }

    fn put_entry(
        index: &Index,
        content: &ContentStore,
        seq: u64,
        text: &str,
        importance: f64,
        links: Links,
        kind: EntryKind,
    ) {
        let normalized = crate::content::normalize(text);
        let hash = content.put(&normalized).unwrap();
        let entry = Entry {
            seq,
            prev_hash: "00".repeat(32),
            content_hash: hash.clone(),
            payload_ref: hash,
            entry_kind: kind,
            tier: Tier::Ephemeral,
            created_at: Utc::now(),
            provenance: Provenance {
                importance,
                ..Provenance::default()
            },
            links,
            signature: "ee".repeat(64),
        };
        index.apply(&entry, None).unwrap();
    }

    #[test]
    fn query_filters_to_lexical_matches() {
        let (_dir, index, content, config) = fixture();
        put_entry(&index, &content, 0, "user prefers dark mode", 0.8, Links::default(), EntryKind::Memory);
        put_entry(&index, &content, 1, "meeting at noon", 0.5, Links::default(), EntryKind::Memory);

        let hits = recall(&index, &content, &config, "dark", &RecallOptions::default(), Utc::now()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].seq, 0);
        assert_eq!(hits[0].content, "user prefers dark mode");
    }

    #[test]
    fn empty_query_returns_everything_ranked() {
        let (_dir, index, content, config) = fixture();
        put_entry(&index, &content, 0, "low importance note", 0.1, Links::default(), EntryKind::Memory);
        put_entry(&index, &content, 1, "high importance note", 0.9, Links::default(), EntryKind::Memory);

        let hits = recall(&index, &content, &config, "", &RecallOptions::default(), Utc::now()).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].seq, 1, "higher importance ranks first");
    }

    #[test]
    fn superseded_entries_are_hidden_by_default() {
        let (_dir, index, content, config) = fixture();
        put_entry(&index, &content, 0, "old understanding of A", 0.5, Links::default(), EntryKind::Memory);
        put_entry(
            &index,
            &content,
            1,
            "A unified and corrected",
            0.5,
            Links {
                supersedes: vec![0],
                ..Links::default()
            },
            EntryKind::Consolidation,
        );

        let frontier =
            recall(&index, &content, &config, "A", &RecallOptions::default(), Utc::now()).unwrap();
        assert_eq!(frontier.iter().map(|h| h.seq).collect::<Vec<_>>(), vec![1]);

        let historical = recall(
            &index,
            &content,
            &config,
            "A",
            &RecallOptions {
                include_superseded: true,
                ..RecallOptions::default()
            },
            Utc::now(),
        )
        .unwrap();
        let mut seqs: Vec<u64> = historical.iter().map(|h| h.seq).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn equal_scores_break_ties_by_larger_seq() {
        let (_dir, index, content, config) = fixture();
        put_entry(&index, &content, 0, "twin note alpha", 0.5, Links::default(), EntryKind::Memory);
        put_entry(&index, &content, 1, "twin note alpha copy", 0.5, Links::default(), EntryKind::Memory);

        let hits = recall(&index, &content, &config, "twin", &RecallOptions::default(), Utc::now()).unwrap();
        assert_eq!(hits[0].seq, 1);
        assert_eq!(hits[1].seq, 0);
    }

    #[test]
    fn token_budget_cuts_the_tail() {
        let (_dir, index, content, config) = fixture();
        put_entry(&index, &content, 0, "budget test entry one", 0.9, Links::default(), EntryKind::Memory);
        put_entry(&index, &content, 1, "budget test entry two", 0.1, Links::default(), EntryKind::Memory);

        let hits = recall(
            &index,
            &content,
            &config,
            "budget",
            &RecallOptions {
                max_tokens: Some(6),
                ..RecallOptions::default()
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(hits.len(), 1, "second hit exceeds the 6-token budget");
        assert_eq!(hits[0].seq, 0);
    }

    #[test]
    fn returned_hits_are_touched() {
        let (_dir, index, content, config) = fixture();
        put_entry(&index, &content, 0, "touch me", 0.5, Links::default(), EntryKind::Memory);
        put_entry(&index, &content, 1, "not matching", 0.5, Links::default(), EntryKind::Memory);

        recall(&index, &content, &config, "touch", &RecallOptions::default(), Utc::now()).unwrap();

        assert_eq!(index.get(0).unwrap().unwrap().access_count, 1);
        assert_eq!(index.get(1).unwrap().unwrap().access_count, 0);
    }

    #[test]
    fn tier_filter_applies() {
        let (_dir, index, content, config) = fixture();
        put_entry(&index, &content, 0, "ephemeral scratch", 0.5, Links::default(), EntryKind::Memory);
        let hits = recall(
            &index,
            &content,
            &config,
            "",
            &RecallOptions {
                tiers: Some(vec![Tier::Committed]),
                ..RecallOptions::default()
            },
            Utc::now(),
        )
        .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn max_results_caps_before_budget() {
        let (_dir, index, content, config) = fixture();
        for seq in 0..5 {
            put_entry(&index, &content, seq, &format!("note number {seq}"), 0.5, Links::default(), EntryKind::Memory);
        }
        let hits = recall(
            &index,
            &content,
            &config,
            "note",
            &RecallOptions {
                max_results: Some(2),
                ..RecallOptions::default()
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(hits.len(), 2);
    }
}
