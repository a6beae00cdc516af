//! Supersession: the `rethink` operation.
//!
//! A consolidation entry carries forward edges to the entries it replaces.
//! Originals are never mutated, which is what keeps their signatures valid;
//! retrieval simply defaults to the non-superseded frontier. Consolidating
//! an already-superseded entry is allowed and chains — the most recent
//! consolidation wins for filtering.

use serde::Serialize;

use crate::entry::EntryKind;
use crate::index::Index;
use crate::ChainError;

#[derive(Debug, Clone, Serialize)]
pub struct RethinkResult {
    pub consolidation_seq: u64,
    pub superseded_count: usize,
}

/// Validate a rethink's target list against the current chain state.
///
/// Returns the largest importance among the targets, which the new
/// consolidation entry inherits (never below the 0.5 default).
pub(crate) fn validate_supersedes(
    index: &Index,
    supersedes: &[u64],
    next_seq: u64,
) -> Result<f64, ChainError> {
    if supersedes.is_empty() {
        return Err(ChainError::InvalidInput(
            "rethink requires at least one superseded seq".to_string(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    let mut importance: f64 = 0.5;
    for &seq in supersedes {
        if !seen.insert(seq) {
            return Err(ChainError::CyclicSupersede(seq));
        }
        if seq == next_seq {
            // The list names the seq the consolidation itself will occupy.
            return Err(ChainError::CyclicSupersede(seq));
        }
        let row = index.get(seq)?.ok_or(ChainError::UnknownSeq(seq))?;
        if row.kind == EntryKind::Redaction {
            return Err(ChainError::InvalidInput(format!(
                "seq {seq} is a redaction and cannot be superseded"
            )));
        }
        if row.redacted {
            return Err(ChainError::InvalidInput(format!(
                "seq {seq} is redacted and cannot be superseded"
            )));
        }
        importance = importance.max(row.importance);
    }
    Ok(importance)
}
