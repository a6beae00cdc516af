//! Full-chain verification and index reconstruction.
//!
//! The journal is the source of truth; the index is a cache. Any divergence
//! is resolved by replaying the journal, and any doubt about the journal is
//! resolved by walking it from seq 0 and re-checking every invariant.

use tracing::{info, warn};

use crate::anchor::AnchorRegistry;
use crate::content::{content_digest, ContentStore};
use crate::entry::{Entry, EntryKind, RedactionPayload, ZERO_DIGEST};
use crate::index::Index;
use crate::journal::Journal;
use crate::keys::verify_signature;
use crate::ChainError;
use ed25519_dalek::VerifyingKey;

/// Which chain invariant a failing entry violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Invariant {
    Framing,
    Seq,
    PrevHash,
    Signature,
    ContentDigest,
    Supersedes,
    BlockLineage,
}

impl Invariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Invariant::Framing => "framing",
            Invariant::Seq => "seq",
            Invariant::PrevHash => "prev_hash",
            Invariant::Signature => "signature",
            Invariant::ContentDigest => "content_digest",
            Invariant::Supersedes => "supersedes",
            Invariant::BlockLineage => "block_lineage",
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct VerifyFailure {
    pub seq: u64,
    pub invariant: Invariant,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct VerifyReport {
    pub ok: bool,
    pub checked: u64,
    pub first_failure: Option<VerifyFailure>,
    /// Failing entries after the first; scanning continues only to count.
    pub anomalies: u64,
}

/// Walk the journal from 0 to head, checking framing, seq contiguity,
/// prev_hash linkage, signatures, blob digests, supersession targets, and
/// block lineage. Blob digests are skipped for redaction targets, whose
/// payloads were deliberately replaced with the sentinel.
pub fn verify_chain(
    journal: &Journal,
    content: &ContentStore,
    public: &VerifyingKey,
) -> Result<VerifyReport, ChainError> {
    let lines = journal.raw_lines()?;
    let parsed: Vec<Result<Entry, ChainError>> = lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            Entry::decode_line(line).map_err(|e| ChainError::Corrupt(format!("entry {i}: {e}")))
        })
        .collect();

    // Redaction targets get a pass on the blob-digest check.
    let mut redacted = std::collections::HashSet::new();
    for entry in parsed.iter().flatten() {
        if entry.entry_kind == EntryKind::Redaction {
            if let Some(payload) = content.get(&entry.content_hash)? {
                if let Ok(redaction) = serde_json::from_str::<RedactionPayload>(&payload) {
                    redacted.insert(redaction.redacted_seq);
                }
            }
        }
    }

    let mut first_failure = None;
    let mut anomalies = 0u64;
    let mut record = |failure: VerifyFailure| {
        if first_failure.is_none() {
            first_failure = Some(failure);
        } else {
            anomalies += 1;
        }
    };

    for (i, item) in parsed.iter().enumerate() {
        let seq = i as u64;
        if let Some(invariant) =
            check_entry(&parsed, item, &lines[i], seq, content, public, &redacted)?
        {
            record(VerifyFailure { seq, invariant });
        }
    }

    let checked = parsed.len() as u64;
    let report = VerifyReport {
        ok: first_failure.is_none(),
        checked,
        first_failure,
        anomalies,
    };
    if !report.ok {
        warn!(?report.first_failure, anomalies = report.anomalies, "chain verification failed");
    }
    Ok(report)
}

fn check_entry(
    parsed: &[Result<Entry, ChainError>],
    item: &Result<Entry, ChainError>,
    line: &str,
    seq: u64,
    content: &ContentStore,
    public: &VerifyingKey,
    redacted: &std::collections::HashSet<u64>,
) -> Result<Option<Invariant>, ChainError> {
    let Ok(entry) = item else {
        return Ok(Some(Invariant::Framing));
    };

    // The stored line must be exactly the canonical re-encoding: any byte
    // that decodes to the same entry but reads differently is still tamper.
    if entry.encode_line()? != line {
        return Ok(Some(Invariant::Framing));
    }

    if entry.seq != seq {
        return Ok(Some(Invariant::Seq));
    }

    let expected_prev = if seq == 0 {
        ZERO_DIGEST.to_string()
    } else {
        match &parsed[seq as usize - 1] {
            Ok(prev) => prev.digest()?,
            // Predecessor already failed framing; its digest is unknowable.
            Err(_) => return Ok(Some(Invariant::PrevHash)),
        }
    };
    if entry.prev_hash != expected_prev {
        return Ok(Some(Invariant::PrevHash));
    }

    if !verify_signature(public, &entry.canonical_bytes()?, &entry.signature) {
        return Ok(Some(Invariant::Signature));
    }

    if entry.payload_ref != entry.content_hash {
        return Ok(Some(Invariant::ContentDigest));
    }
    if !redacted.contains(&seq) {
        match content.get(&entry.content_hash) {
            Ok(Some(blob)) => {
                if content_digest(&blob) != entry.content_hash {
                    return Ok(Some(Invariant::ContentDigest));
                }
            }
            Ok(None) => return Ok(Some(Invariant::ContentDigest)),
            Err(ChainError::InvalidInput(_)) => return Ok(Some(Invariant::ContentDigest)),
            Err(e) => return Err(e),
        }
    }

    for &target in &entry.links.supersedes {
        if target >= seq || !matches!(parsed.get(target as usize), Some(Ok(_))) {
            return Ok(Some(Invariant::Supersedes));
        }
    }

    if entry.entry_kind == EntryKind::Block {
        let (Some(label), Some(version)) = (entry.links.block_label, entry.links.block_version)
        else {
            return Ok(Some(Invariant::BlockLineage));
        };
        match entry.links.prev_block_seq {
            None => {
                if version != 1 {
                    return Ok(Some(Invariant::BlockLineage));
                }
            }
            Some(prev_seq) => {
                if prev_seq >= seq {
                    return Ok(Some(Invariant::BlockLineage));
                }
                let Some(Ok(prev)) = parsed.get(prev_seq as usize) else {
                    return Ok(Some(Invariant::BlockLineage));
                };
                if prev.entry_kind != EntryKind::Block
                    || prev.links.block_label != Some(label)
                    || prev.links.block_version.map(|v| v + 1) != Some(version)
                {
                    return Ok(Some(Invariant::BlockLineage));
                }
            }
        }
    }

    Ok(None)
}

/// Drop and repopulate the index from the journal. Anchor receipts live in
/// the sidecar files and are re-cached afterwards, so they survive.
pub fn rebuild_index(
    journal: &Journal,
    content: &ContentStore,
    index: &Index,
    registry: &AnchorRegistry,
) -> Result<u64, ChainError> {
    index.clear()?;
    let mut count = 0u64;
    for item in journal.iter()? {
        let entry = item?;
        let redaction = redaction_payload(content, &entry)?;
        index.apply(&entry, redaction.as_ref())?;
        count += 1;
    }
    for receipt in registry.receipts(None)? {
        index.cache_anchor(receipt.seq, &receipt.provider, &serde_json::to_string(&receipt)?)?;
    }
    info!(entries = count, "index rebuilt from journal");
    Ok(count)
}

/// Apply journal entries the index has not seen yet. Covers a crash between
/// the journal fsync and the index transaction; bounded by the gap size.
pub fn forward_roll(
    journal: &Journal,
    content: &ContentStore,
    index: &Index,
) -> Result<u64, ChainError> {
    let start = match index.max_seq()? {
        Some(max) => max + 1,
        None => 0,
    };
    let end = journal.next_seq();
    let mut count = 0u64;
    for seq in start..end {
        let entry = journal.read(seq)?;
        let redaction = redaction_payload(content, &entry)?;
        index.apply(&entry, redaction.as_ref())?;
        count += 1;
    }
    if count > 0 {
        info!(applied = count, "forward-rolled index to journal head");
    }
    Ok(count)
}

fn redaction_payload(
    content: &ContentStore,
    entry: &Entry,
) -> Result<Option<RedactionPayload>, ChainError> {
    if entry.entry_kind != EntryKind::Redaction {
        return Ok(None);
    }
    let Some(payload) = content.get(&entry.content_hash)? else {
        return Ok(None);
    };
    serde_json::from_str(&payload)
        .map(Some)
        .map_err(|e| ChainError::Corrupt(format!("redaction payload at {}: {e}", entry.seq)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::normalize;
    use crate::entry::{Links, Provenance, Tier};
    use crate::journal::EntryDraft;
    use crate::keys::WriterKey;
    use chrono::Utc;

    struct Fixture {
        _dir: tempfile::TempDir,
        journal: Journal,
        content: ContentStore,
        key: WriterKey,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path(), None).unwrap();
        let content = ContentStore::open(dir.path()).unwrap();
        Fixture {
            _dir: dir,
            journal,
            content,
            key: WriterKey::generate(),
        }
    }

    fn commit(fx: &mut Fixture, text: &str, kind: EntryKind, links: Links) -> Entry {
        let normalized = normalize(text);
        let hash = fx.content.put(&normalized).unwrap();
        fx.journal
            .append(
                EntryDraft {
                    content_hash: hash,
                    entry_kind: kind,
                    tier: Tier::Ephemeral,
                    created_at: Utc::now(),
                    provenance: Provenance::default(),
                    links,
                },
                &fx.key,
            )
            .unwrap()
    }

    #[test]
    fn clean_chain_verifies() {
        let mut fx = fixture();
        commit(&mut fx, "alpha", EntryKind::Memory, Links::default());
        commit(&mut fx, "beta", EntryKind::Memory, Links::default());
        commit(
            &mut fx,
            "alpha and beta unified",
            EntryKind::Consolidation,
            Links {
                supersedes: vec![0, 1],
                ..Links::default()
            },
        );

        let report =
            verify_chain(&fx.journal, &fx.content, &fx.key.verifying_key()).unwrap();
        assert!(report.ok, "{:?}", report.first_failure);
        assert_eq!(report.checked, 3);
        assert_eq!(report.anomalies, 0);
    }

    #[test]
    fn empty_chain_verifies() {
        let fx = fixture();
        let report =
            verify_chain(&fx.journal, &fx.content, &fx.key.verifying_key()).unwrap();
        assert!(report.ok);
        assert_eq!(report.checked, 0);
    }

    #[test]
    fn wrong_key_fails_every_signature() {
        let mut fx = fixture();
        commit(&mut fx, "alpha", EntryKind::Memory, Links::default());
        let stranger = WriterKey::generate();
        let report = verify_chain(&fx.journal, &fx.content, &stranger.verifying_key()).unwrap();
        assert!(!report.ok);
        assert_eq!(report.first_failure.unwrap().invariant, Invariant::Signature);
    }

    #[test]
    fn missing_blob_is_a_content_failure() {
        let mut fx = fixture();
        let entry = commit(&mut fx, "vanishing payload", EntryKind::Memory, Links::default());
        let path = fx
            ._dir
            .path()
            .join("content")
            .join(&entry.content_hash[..2])
            .join(&entry.content_hash);
        std::fs::remove_file(path).unwrap();

        let report =
            verify_chain(&fx.journal, &fx.content, &fx.key.verifying_key()).unwrap();
        let failure = report.first_failure.unwrap();
        assert_eq!(failure.seq, 0);
        assert_eq!(failure.invariant, Invariant::ContentDigest);
    }

    #[test]
    fn forward_supersedes_reference_fails() {
        let mut fx = fixture();
        // Hand-roll an entry whose supersedes points forward.
        commit(
            &mut fx,
            "points at the future",
            EntryKind::Consolidation,
            Links {
                supersedes: vec![5],
                ..Links::default()
            },
        );
        let report =
            verify_chain(&fx.journal, &fx.content, &fx.key.verifying_key()).unwrap();
        assert_eq!(report.first_failure.unwrap().invariant, Invariant::Supersedes);
    }

    #[test]
    fn block_version_gap_fails_lineage() {
        let mut fx = fixture();
        commit(
            &mut fx,
            "persona v1",
            EntryKind::Block,
            Links {
                block_label: Some(crate::entry::BlockLabel::Persona),
                block_version: Some(1),
                is_core: true,
                ..Links::default()
            },
        );
        commit(
            &mut fx,
            "persona v3",
            EntryKind::Block,
            Links {
                supersedes: vec![0],
                block_label: Some(crate::entry::BlockLabel::Persona),
                block_version: Some(3),
                prev_block_seq: Some(0),
                is_core: true,
                ..Links::default()
            },
        );
        let report =
            verify_chain(&fx.journal, &fx.content, &fx.key.verifying_key()).unwrap();
        let failure = report.first_failure.unwrap();
        assert_eq!(failure.seq, 1);
        assert_eq!(failure.invariant, Invariant::BlockLineage);
    }

    #[test]
    fn redacted_blob_is_excused_from_digest_check() {
        let mut fx = fixture();
        let target = commit(&mut fx, "to be forgotten", EntryKind::Memory, Links::default());
        let payload = serde_json::to_string(&RedactionPayload {
            redacted_seq: target.seq,
            reason: Some("privacy".to_string()),
        })
        .unwrap();
        commit(&mut fx, &payload, EntryKind::Redaction, Links::default());
        fx.content.redact(&target.content_hash).unwrap();

        let report =
            verify_chain(&fx.journal, &fx.content, &fx.key.verifying_key()).unwrap();
        assert!(report.ok, "{:?}", report.first_failure);
    }

    #[test]
    fn rebuild_reconstructs_supersession_and_blocks() {
        let mut fx = fixture();
        commit(&mut fx, "old fact", EntryKind::Memory, Links::default());
        commit(
            &mut fx,
            "new fact",
            EntryKind::Consolidation,
            Links {
                supersedes: vec![0],
                ..Links::default()
            },
        );
        commit(
            &mut fx,
            "persona v1",
            EntryKind::Block,
            Links {
                block_label: Some(crate::entry::BlockLabel::Persona),
                block_version: Some(1),
                is_core: true,
                ..Links::default()
            },
        );

        let index = Index::open_in_memory().unwrap();
        let registry = AnchorRegistry::open(fx._dir.path()).unwrap();
        let count = rebuild_index(&fx.journal, &fx.content, &index, &registry).unwrap();
        assert_eq!(count, 3);
        assert!(index.get(0).unwrap().unwrap().is_superseded);
        assert_eq!(
            index.block_latest(crate::entry::BlockLabel::Persona).unwrap(),
            Some(2)
        );
        // Idempotent.
        rebuild_index(&fx.journal, &fx.content, &index, &registry).unwrap();
        assert_eq!(index.max_seq().unwrap(), Some(2));
    }

    #[test]
    fn forward_roll_applies_only_the_gap() {
        let mut fx = fixture();
        let index = Index::open_in_memory().unwrap();
        for i in 0..5 {
            let entry = commit(&mut fx, &format!("entry {i}"), EntryKind::Memory, Links::default());
            if i < 4 {
                index.apply(&entry, None).unwrap();
            }
        }
        assert_eq!(index.max_seq().unwrap(), Some(3));
        let applied = forward_roll(&fx.journal, &fx.content, &index).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(index.max_seq().unwrap(), Some(4));
        // Nothing left to roll.
        assert_eq!(forward_roll(&fx.journal, &fx.content, &index).unwrap(), 0);
    }
}
