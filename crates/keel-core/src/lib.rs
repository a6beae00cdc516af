//! Verifiable, append-only memory for AI agents.
//!
//! Every remembered fact is a signed, hash-linked, content-addressed entry
//! in a single-writer chain. The journal is the sole source of truth; a
//! SQLite index derived from it serves recall, and an anchor registry can
//! bind chain state to external timestamping authorities.

pub mod anchor;
pub mod blocks;
pub mod config;
pub mod consolidate;
pub mod content;
pub mod entry;
pub mod index;
pub mod journal;
pub mod keys;
pub mod lock;
pub mod recall;
pub mod score;
pub mod verify;

pub use anchor::{
    AnchorBackend, AnchorOptions, AnchorReceipt, AnchorRegistry, AnchorStatus, CostEstimate,
    LocalClockBackend, Submission, UpgradeSummary, VerifyOutcome,
};
pub use blocks::BlockUpdateResult;
pub use config::ChainConfig;
pub use consolidate::RethinkResult;
pub use entry::{
    BlockLabel, Entry, EntryKind, Links, Provenance, RedactionPayload, Source, Tier, ZERO_DIGEST,
};
pub use index::Index;
pub use journal::{EntryDraft, Head, Journal};
pub use keys::WriterKey;
pub use recall::{RecallHit, RecallOptions};
pub use score::DecayTier;
pub use verify::{Invariant, VerifyFailure, VerifyReport};

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde::Serialize;
use tracing::info;

use crate::content::ContentStore;
use crate::lock::ChainLock;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown seq {0}")]
    UnknownSeq(u64),
    #[error("cyclic supersede involving seq {0}")]
    CyclicSupersede(u64),
    #[error("chain is write-locked by pid {0}")]
    WriteLocked(u32),
    #[error("signature failure: {0}")]
    SignatureFailed(String),
    #[error("verification failed at seq {seq}: {invariant}")]
    VerifyFailed { seq: u64, invariant: &'static str },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt chain: {0}")]
    Corrupt(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("backend timeout: {0}")]
    BackendTimeout(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl ChainError {
    /// Stable machine-readable tag per error kind; the CLI keys exit codes
    /// off this.
    pub fn tag(&self) -> &'static str {
        match self {
            ChainError::InvalidInput(_) => "invalid_input",
            ChainError::UnknownSeq(_) => "unknown_seq",
            ChainError::CyclicSupersede(_) => "cyclic_supersede",
            ChainError::WriteLocked(_) => "write_locked",
            ChainError::SignatureFailed(_) => "signature_failed",
            ChainError::VerifyFailed { .. } => "verify_failed",
            ChainError::Io(_) | ChainError::Sql(_) | ChainError::Encode(_) => "io_error",
            ChainError::Corrupt(_) => "corrupt",
            ChainError::BackendUnavailable(_) => "backend_unavailable",
            ChainError::BackendTimeout(_) => "backend_timeout",
            ChainError::Conflict(_) => "conflict",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommitOptions {
    pub entry_kind: EntryKind,
    pub tier: Tier,
    pub provenance: Provenance,
    pub links: Links,
    /// Writer-chosen timestamp; defaults to now.
    pub created_at: Option<DateTime<Utc>>,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            entry_kind: EntryKind::Memory,
            tier: Tier::Ephemeral,
            provenance: Provenance::default(),
            links: Links::default(),
            created_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitReceipt {
    pub seq: u64,
    pub content_hash: String,
}

/// Read-only composite view of one entry. Performs no touches.
#[derive(Debug, Clone, Serialize)]
pub struct Introspection {
    pub entry: Entry,
    pub content: Option<String>,
    pub source: Source,
    pub trigger: Option<String>,
    pub superseded_by: Option<u64>,
    pub supersedes: Vec<u64>,
    pub redacted: bool,
    pub anchor_receipts: Vec<AnchorReceipt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStats {
    pub head_seq: Option<u64>,
    pub entries: u64,
    pub by_kind: Vec<(String, u64)>,
    pub by_tier: Vec<(String, u64)>,
    pub by_decay: Vec<(String, u64)>,
    pub superseded: u64,
    pub core: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportEntry {
    pub entry: Entry,
    pub content: Option<String>,
}

/// One open chain: writer key, journal, content store, derived index, and
/// anchor registry, rooted in a single directory.
pub struct MemoryChain {
    dir: PathBuf,
    config: ChainConfig,
    key: WriterKey,
    public: VerifyingKey,
    journal: Journal,
    content: ContentStore,
    index: Index,
    registry: AnchorRegistry,
}

impl MemoryChain {
    /// Create the chain directory and keypair if absent, then open.
    pub fn init(dir: &Path) -> Result<Self, ChainError> {
        Self::init_with(dir, ChainConfig::default(), None)
    }

    pub fn init_with(
        dir: &Path,
        config: ChainConfig,
        key_path: Option<&Path>,
    ) -> Result<Self, ChainError> {
        std::fs::create_dir_all(dir)?;
        let key_file = key_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dir.join("agent.key"));
        if !key_file.exists() {
            let key = WriterKey::generate();
            key.save(&key_file, &dir.join("agent.pub"))?;
            info!(dir = %dir.display(), "generated writer keypair");
        }
        Self::open_with(dir, config, key_path)
    }

    pub fn open(dir: &Path) -> Result<Self, ChainError> {
        Self::open_with(dir, ChainConfig::default(), None)
    }

    pub fn open_with(
        dir: &Path,
        config: ChainConfig,
        key_path: Option<&Path>,
    ) -> Result<Self, ChainError> {
        let key_file = key_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dir.join("agent.key"));
        let key = WriterKey::load(&key_file)?;
        let pub_file = dir.join("agent.pub");
        let public = if pub_file.exists() {
            keys::load_public(&pub_file)?
        } else {
            key.verifying_key()
        };

        let journal = Journal::open(dir, Some(&public))?;
        let content = ContentStore::open(dir)?;
        let index = Index::open(dir.join("memory.db"))?;
        // Catch the index up if a crash landed between journal and index.
        verify::forward_roll(&journal, &content, &index)?;
        let registry = AnchorRegistry::open(dir)?;

        info!(dir = %dir.display(), head = ?journal.head().map(|h| h.seq), "chain opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            key,
            public,
            journal,
            content,
            index,
            registry,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.public
    }

    pub fn head(&self) -> Option<&Head> {
        self.journal.head()
    }

    /// Append one memory entry: normalize, store the blob, append to the
    /// journal, project into the index.
    pub fn commit(&mut self, text: &str, options: CommitOptions) -> Result<CommitReceipt, ChainError> {
        if !matches!(
            options.entry_kind,
            EntryKind::Memory | EntryKind::Identity | EntryKind::Decision
        ) {
            return Err(ChainError::InvalidInput(format!(
                "commit cannot write {} entries",
                options.entry_kind.as_str()
            )));
        }
        if !options.links.supersedes.is_empty() {
            return Err(ChainError::InvalidInput(
                "supersession goes through rethink".to_string(),
            ));
        }
        if options.links.block_label.is_some()
            || options.links.block_version.is_some()
            || options.links.prev_block_seq.is_some()
        {
            return Err(ChainError::InvalidInput(
                "block lineage goes through block_update".to_string(),
            ));
        }
        let importance = options.provenance.importance;
        if !(0.0..=1.0).contains(&importance) || !importance.is_finite() {
            return Err(ChainError::InvalidInput(format!(
                "importance {importance} outside [0.0, 1.0]"
            )));
        }
        let normalized = content::normalize(text);
        if normalized.is_empty() {
            return Err(ChainError::InvalidInput("empty content".to_string()));
        }

        let _guard = self.write_guard()?;
        let content_hash = self.content.put(&normalized)?;
        let entry = self.journal.append(
            EntryDraft {
                content_hash,
                entry_kind: options.entry_kind,
                tier: options.tier,
                created_at: options.created_at.unwrap_or_else(Utc::now),
                provenance: options.provenance,
                links: options.links,
            },
            &self.key,
        )?;
        self.index.apply(&entry, None)?;
        info!(seq = entry.seq, kind = entry.entry_kind.as_str(), "entry committed");
        Ok(CommitReceipt {
            seq: entry.seq,
            content_hash: entry.content_hash,
        })
    }

    pub fn recall(&self, query: &str, options: &RecallOptions) -> Result<Vec<RecallHit>, ChainError> {
        recall::recall(
            &self.index,
            &self.content,
            &self.config,
            query,
            options,
            Utc::now(),
        )
    }

    /// Replace the meaning of earlier entries with a consolidation entry.
    pub fn rethink(
        &mut self,
        supersedes: &[u64],
        new_understanding: &str,
        reason: Option<&str>,
    ) -> Result<RethinkResult, ChainError> {
        let normalized = content::normalize(new_understanding);
        if normalized.is_empty() {
            return Err(ChainError::InvalidInput("empty new understanding".to_string()));
        }

        let _guard = self.write_guard()?;
        let importance =
            consolidate::validate_supersedes(&self.index, supersedes, self.journal.next_seq())?;
        let content_hash = self.content.put(&normalized)?;
        let entry = self.journal.append(
            EntryDraft {
                content_hash,
                entry_kind: EntryKind::Consolidation,
                tier: Tier::Committed,
                created_at: Utc::now(),
                provenance: Provenance {
                    source: Source::Consolidation,
                    trigger: reason.map(str::to_string),
                    importance,
                    emotion_tag: None,
                },
                links: Links {
                    supersedes: supersedes.to_vec(),
                    ..Links::default()
                },
            },
            &self.key,
        )?;
        self.index.apply(&entry, None)?;
        info!(
            seq = entry.seq,
            superseded = supersedes.len(),
            "consolidation committed"
        );
        Ok(RethinkResult {
            consolidation_seq: entry.seq,
            superseded_count: supersedes.len(),
        })
    }

    /// Append a new version of a labeled block, superseding the previous one.
    pub fn block_update(
        &mut self,
        label: BlockLabel,
        text: &str,
        is_core: bool,
    ) -> Result<BlockUpdateResult, ChainError> {
        let normalized = content::normalize(text);
        if normalized.is_empty() {
            return Err(ChainError::InvalidInput("empty block content".to_string()));
        }

        let _guard = self.write_guard()?;
        let (prev_block_seq, version) = blocks::next_lineage(&self.index, label)?;
        let content_hash = self.content.put(&normalized)?;
        let entry = self.journal.append(
            EntryDraft {
                content_hash,
                entry_kind: EntryKind::Block,
                tier: Tier::Committed,
                created_at: Utc::now(),
                provenance: Provenance::default(),
                links: Links {
                    supersedes: prev_block_seq.into_iter().collect(),
                    block_label: Some(label),
                    block_version: Some(version),
                    prev_block_seq,
                    is_core,
                    ..Links::default()
                },
            },
            &self.key,
        )?;
        self.index.apply(&entry, None)?;
        info!(seq = entry.seq, label = label.as_str(), version, "block updated");
        Ok(BlockUpdateResult {
            seq: entry.seq,
            version,
        })
    }

    /// Model deletion: append a redaction entry naming the target, then
    /// overwrite the target's blob with the sentinel. The target's signed
    /// header stays in the chain and keeps verifying.
    pub fn redact(&mut self, target: u64, reason: Option<&str>) -> Result<CommitReceipt, ChainError> {
        let _guard = self.write_guard()?;
        let row = self.index.get(target)?.ok_or(ChainError::UnknownSeq(target))?;
        if row.kind == EntryKind::Redaction {
            return Err(ChainError::InvalidInput(
                "cannot redact a redaction entry".to_string(),
            ));
        }
        if row.redacted {
            return Err(ChainError::Conflict(format!("seq {target} is already redacted")));
        }

        let payload = RedactionPayload {
            redacted_seq: target,
            reason: reason.map(str::to_string),
        };
        let normalized = content::normalize(&serde_json::to_string(&payload)?);
        let content_hash = self.content.put(&normalized)?;
        let entry = self.journal.append(
            EntryDraft {
                content_hash,
                entry_kind: EntryKind::Redaction,
                tier: Tier::Committed,
                created_at: Utc::now(),
                provenance: Provenance {
                    trigger: reason.map(str::to_string),
                    ..Provenance::default()
                },
                links: Links::default(),
            },
            &self.key,
        )?;
        self.index.apply(&entry, Some(&payload))?;
        self.content.redact(&row.content_hash)?;
        info!(seq = entry.seq, target, "redaction committed");
        Ok(CommitReceipt {
            seq: entry.seq,
            content_hash: entry.content_hash,
        })
    }

    /// Read-only composite: entry, provenance, supersession state, and any
    /// anchor receipts. No access counters move.
    pub fn introspect(&self, seq: u64) -> Result<Introspection, ChainError> {
        let entry = self.journal.read(seq)?;
        let row = self.index.get(seq)?;
        let content = self.content.get(&entry.content_hash)?;
        let anchor_receipts = self.registry.receipts(Some(seq))?;
        Ok(Introspection {
            source: entry.provenance.source,
            trigger: entry.provenance.trigger.clone(),
            supersedes: entry.links.supersedes.clone(),
            superseded_by: row.as_ref().and_then(|r| r.superseded_by),
            redacted: row.as_ref().map(|r| r.redacted).unwrap_or(false),
            content,
            anchor_receipts,
            entry,
        })
    }

    /// Non-superseded entries flagged as core, with their payloads.
    pub fn core_memories(&self) -> Result<Vec<(u64, String)>, ChainError> {
        let mut out = Vec::new();
        for row in self.index.core_memories()? {
            if let Some(text) = self.content.get(&row.content_hash)? {
                out.push((row.seq, text));
            }
        }
        Ok(out)
    }

    pub fn verify(&self) -> Result<VerifyReport, ChainError> {
        verify::verify_chain(&self.journal, &self.content, &self.public)
    }

    /// Drop and repopulate the index from the journal.
    pub fn rebuild(&self) -> Result<u64, ChainError> {
        verify::rebuild_index(&self.journal, &self.content, &self.index, &self.registry)
    }

    pub fn stats(&self) -> Result<ChainStats, ChainError> {
        let now = Utc::now();
        let mut hot = 0u64;
        let mut warm = 0u64;
        let mut cold = 0u64;
        for (created_at, last_accessed) in self.index.access_times()? {
            match score::decay_tier(created_at, last_accessed, now, &self.config) {
                DecayTier::Hot => hot += 1,
                DecayTier::Warm => warm += 1,
                DecayTier::Cold => cold += 1,
            }
        }
        Ok(ChainStats {
            head_seq: self.journal.head().map(|h| h.seq),
            entries: self.journal.len(),
            by_kind: self.index.counts_by_kind()?,
            by_tier: self.index.counts_by_tier()?,
            by_decay: vec![
                ("hot".to_string(), hot),
                ("warm".to_string(), warm),
                ("cold".to_string(), cold),
            ],
            superseded: self.index.superseded_count()?,
            core: self.index.core_count()?,
        })
    }

    /// Stream every entry with its payload, journal order.
    pub fn export(&self) -> Result<Vec<ExportEntry>, ChainError> {
        let mut out = Vec::new();
        for item in self.journal.iter()? {
            let entry = item?;
            let content = self.content.get(&entry.content_hash)?;
            out.push(ExportEntry { entry, content });
        }
        Ok(out)
    }

    // ── Anchoring ────────────────────────────────────────────

    pub fn register_backend(&mut self, backend: Box<dyn AnchorBackend>) {
        self.registry.register(backend);
    }

    pub fn anchor_providers(&self) -> Vec<&str> {
        self.registry.providers()
    }

    /// Anchor one entry, or the current head when `seq` is `None`.
    pub fn anchor(&self, provider: &str, seq: Option<u64>) -> Result<AnchorReceipt, ChainError> {
        let seq = match seq {
            Some(seq) => seq,
            None => self
                .journal
                .head()
                .map(|h| h.seq)
                .ok_or_else(|| ChainError::InvalidInput("empty chain has no head".to_string()))?,
        };
        let entry = self.journal.read(seq)?;
        let receipt = self
            .registry
            .submit(provider, &entry, &AnchorOptions::default())?;
        self.index
            .cache_anchor(receipt.seq, &receipt.provider, &serde_json::to_string(&receipt)?)?;
        Ok(receipt)
    }

    pub fn anchor_status(&self, seq: Option<u64>) -> Result<Vec<AnchorReceipt>, ChainError> {
        self.registry.receipts(seq)
    }

    /// Probe pending receipts and persist terminal outcomes. Idempotent.
    pub fn anchor_upgrade(&self) -> Result<UpgradeSummary, ChainError> {
        let summary = self.registry.upgrade(&AnchorOptions::default())?;
        for receipt in self.registry.receipts(None)? {
            self.index
                .cache_anchor(receipt.seq, &receipt.provider, &serde_json::to_string(&receipt)?)?;
        }
        Ok(summary)
    }

    pub fn estimate_anchor_cost(
        &self,
        provider: &str,
        count: usize,
    ) -> Result<CostEstimate, ChainError> {
        self.registry.estimate_cost(provider, count)
    }

    /// Acquire the writer lock and make sure no other process advanced the
    /// chain since this handle last saw it.
    fn write_guard(&self) -> Result<ChainLock, ChainError> {
        let guard = ChainLock::acquire(&self.dir)?;
        self.journal.check_head_unmoved()?;
        Ok(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (tempfile::TempDir, MemoryChain) {
        let dir = tempfile::tempdir().unwrap();
        let chain = MemoryChain::init(dir.path()).unwrap();
        (dir, chain)
    }

    #[test]
    fn init_creates_keys_and_layout() {
        let (dir, chain) = chain();
        assert!(dir.path().join("agent.key").exists());
        assert!(dir.path().join("agent.pub").exists());
        assert!(dir.path().join("content").is_dir());
        assert!(dir.path().join("anchors").is_dir());
        assert!(chain.head().is_none());
    }

    #[test]
    fn init_is_idempotent_on_existing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let first = MemoryChain::init(dir.path()).unwrap();
        let before = *first.public_key();
        drop(first);
        let second = MemoryChain::init(dir.path()).unwrap();
        assert_eq!(before, *second.public_key());
    }

    #[test]
    fn commit_then_recall() {
        let (_dir, mut chain) = chain();
        let receipt = chain
            .commit(
                "user prefers dark mode",
                CommitOptions {
                    provenance: Provenance {
                        importance: 0.8,
                        ..Provenance::default()
                    },
                    ..CommitOptions::default()
                },
            )
            .unwrap();
        assert_eq!(receipt.seq, 0);

        let hits = chain.recall("dark", &RecallOptions::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].seq, 0);
        assert_eq!(hits[0].content, "user prefers dark mode");
    }

    #[test]
    fn commit_rejects_bad_input() {
        let (_dir, mut chain) = chain();
        assert!(matches!(
            chain.commit("", CommitOptions::default()).unwrap_err(),
            ChainError::InvalidInput(_)
        ));
        assert!(matches!(
            chain.commit("\n\n", CommitOptions::default()).unwrap_err(),
            ChainError::InvalidInput(_)
        ));
        assert!(matches!(
            chain
                .commit(
                    "x",
                    CommitOptions {
                        provenance: Provenance {
                            importance: 1.5,
                            ..Provenance::default()
                        },
                        ..CommitOptions::default()
                    }
                )
                .unwrap_err(),
            ChainError::InvalidInput(_)
        ));
        assert!(matches!(
            chain
                .commit(
                    "x",
                    CommitOptions {
                        entry_kind: EntryKind::Consolidation,
                        ..CommitOptions::default()
                    }
                )
                .unwrap_err(),
            ChainError::InvalidInput(_)
        ));
        assert!(matches!(
            chain
                .commit(
                    "x",
                    CommitOptions {
                        links: Links {
                            supersedes: vec![0],
                            ..Links::default()
                        },
                        ..CommitOptions::default()
                    }
                )
                .unwrap_err(),
            ChainError::InvalidInput(_)
        ));
    }

    #[test]
    fn rethink_supersedes_and_filters_recall() {
        let (_dir, mut chain) = chain();
        for text in ["fact A", "fact B", "fact C"] {
            chain.commit(text, CommitOptions::default()).unwrap();
        }
        let result = chain
            .rethink(&[0, 1, 2], "facts A B C unified", Some("cleanup"))
            .unwrap();
        assert_eq!(result.consolidation_seq, 3);
        assert_eq!(result.superseded_count, 3);

        let frontier = chain.recall("fact", &RecallOptions::default()).unwrap();
        assert_eq!(frontier.iter().map(|h| h.seq).collect::<Vec<_>>(), vec![3]);

        let historical = chain
            .recall(
                "fact",
                &RecallOptions {
                    include_superseded: true,
                    ..RecallOptions::default()
                },
            )
            .unwrap();
        assert_eq!(historical.len(), 4);
    }

    #[test]
    fn block_update_versions_and_latest() {
        let (_dir, mut chain) = chain();
        let v1 = chain
            .block_update(BlockLabel::Persona, "I am a careful assistant", true)
            .unwrap();
        let v2 = chain
            .block_update(BlockLabel::Persona, "I am a meticulous assistant", true)
            .unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        let view = chain.introspect(v1.seq).unwrap();
        assert_eq!(view.superseded_by, Some(v2.seq));
        let core = chain.core_memories().unwrap();
        assert_eq!(core.len(), 1);
        assert_eq!(core[0].0, v2.seq);
    }

    #[test]
    fn redact_keeps_header_but_destroys_payload() {
        let (_dir, mut chain) = chain();
        chain.commit("sensitive detail", CommitOptions::default()).unwrap();
        chain.redact(0, Some("user request")).unwrap();

        let view = chain.introspect(0).unwrap();
        assert!(view.redacted);
        assert_eq!(view.content.as_deref(), Some(content::REDACTION_SENTINEL));

        // The chain still verifies and the redacted entry is unrecallable.
        assert!(chain.verify().unwrap().ok);
        assert!(chain.recall("sensitive", &RecallOptions::default()).unwrap().is_empty());

        // Redacting twice is a conflict; redacting the redaction is invalid.
        assert!(matches!(chain.redact(0, None).unwrap_err(), ChainError::Conflict(_)));
        assert!(matches!(chain.redact(1, None).unwrap_err(), ChainError::InvalidInput(_)));
    }

    #[test]
    fn introspect_reports_provenance_without_touching() {
        let (_dir, mut chain) = chain();
        chain
            .commit(
                "decision: use sqlite",
                CommitOptions {
                    entry_kind: EntryKind::Decision,
                    provenance: Provenance {
                        source: Source::Auto,
                        trigger: Some("planning session".to_string()),
                        importance: 0.7,
                        emotion_tag: None,
                    },
                    ..CommitOptions::default()
                },
            )
            .unwrap();
        let view = chain.introspect(0).unwrap();
        assert_eq!(view.source, Source::Auto);
        assert_eq!(view.trigger.as_deref(), Some("planning session"));
        assert!(view.anchor_receipts.is_empty());

        // introspect is read-only: a subsequent empty-query recall sees
        // access_count untouched by it.
        let hits = chain.recall("", &RecallOptions::default()).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn stale_handle_conflicts_instead_of_forking() {
        let dir = tempfile::tempdir().unwrap();
        let mut ours = MemoryChain::init(dir.path()).unwrap();
        ours.commit("first", CommitOptions::default()).unwrap();

        let mut theirs = MemoryChain::open(dir.path()).unwrap();
        theirs.commit("second", CommitOptions::default()).unwrap();

        assert!(matches!(
            ours.commit("third", CommitOptions::default()).unwrap_err(),
            ChainError::Conflict(_)
        ));
    }

    #[test]
    fn stats_count_kinds_and_tiers() {
        let (_dir, mut chain) = chain();
        chain.commit("a", CommitOptions::default()).unwrap();
        chain.commit("b", CommitOptions::default()).unwrap();
        chain.block_update(BlockLabel::Goals, "ship keel", true).unwrap();

        let stats = chain.stats().unwrap();
        assert_eq!(stats.head_seq, Some(2));
        assert_eq!(stats.entries, 3);
        assert!(stats.by_kind.contains(&("memory".to_string(), 2)));
        assert!(stats.by_kind.contains(&("block".to_string(), 1)));
        assert!(stats.by_decay.contains(&("hot".to_string(), 3)));
        assert_eq!(stats.core, 1);
    }

    #[test]
    fn export_streams_all_entries_in_order() {
        let (_dir, mut chain) = chain();
        chain.commit("one", CommitOptions::default()).unwrap();
        chain.commit("two", CommitOptions::default()).unwrap();
        let export = chain.export().unwrap();
        assert_eq!(export.len(), 2);
        assert_eq!(export[0].entry.seq, 0);
        assert_eq!(export[1].content.as_deref(), Some("two"));
    }

    #[test]
    fn error_tags_are_stable() {
        assert_eq!(ChainError::InvalidInput("x".into()).tag(), "invalid_input");
        assert_eq!(ChainError::UnknownSeq(1).tag(), "unknown_seq");
        assert_eq!(ChainError::CyclicSupersede(1).tag(), "cyclic_supersede");
        assert_eq!(ChainError::WriteLocked(1).tag(), "write_locked");
        assert_eq!(ChainError::Conflict("x".into()).tag(), "conflict");
        assert_eq!(
            ChainError::BackendUnavailable("x".into()).tag(),
            "backend_unavailable"
        );
    }
}
