//! Labeled, versioned context blocks.
//!
//! A block is persistent core context under one of the fixed labels. Each
//! update appends a new block entry whose `prev_block_seq` points at the
//! label's previous latest, with the version bumped by one; the predecessor
//! is superseded by the new entry.

use serde::Serialize;

use crate::entry::BlockLabel;
use crate::index::Index;
use crate::ChainError;

#[derive(Debug, Clone, Serialize)]
pub struct BlockUpdateResult {
    pub seq: u64,
    pub version: u32,
}

/// The predecessor seq (if any) and the version the next block entry under
/// `label` must carry. First entry under a label is version 1.
pub(crate) fn next_lineage(
    index: &Index,
    label: BlockLabel,
) -> Result<(Option<u64>, u32), ChainError> {
    let Some(prev_seq) = index.block_latest(label)? else {
        return Ok((None, 1));
    };
    let row = index.get(prev_seq)?.ok_or_else(|| {
        ChainError::Corrupt(format!(
            "block_latest({}) points at missing seq {prev_seq}",
            label.as_str()
        ))
    })?;
    let prev_version = row.block_version.ok_or_else(|| {
        ChainError::Corrupt(format!("block entry {prev_seq} has no version"))
    })?;
    Ok((Some(prev_seq), prev_version + 1))
}
