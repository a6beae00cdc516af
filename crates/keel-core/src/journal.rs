//! The append-only journal: `chain.jsonl`, one canonically-encoded entry per
//! line, plus the `head` pointer file.
//!
//! Append discipline is append-then-fsync-then-publish-head: a reader that
//! observes a given head observes every prior entry fully. The open-time
//! recovery scan truncates a partially-written final line; interior damage
//! is never repaired here and is reported by the verifier instead.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::entry::{Entry, EntryKind, Links, Provenance, Tier, ZERO_DIGEST};
use crate::keys::{verify_signature, WriterKey};
use crate::ChainError;

/// The published tail pointer: seq and canonical digest of the last entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    pub seq: u64,
    pub hash: String,
}

/// Writer-provided fields of an entry; `seq`, `prev_hash`, and `signature`
/// are computed during append.
#[derive(Debug, Clone)]
pub struct EntryDraft {
    pub content_hash: String,
    pub entry_kind: EntryKind,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub provenance: Provenance,
    pub links: Links,
}

pub struct Journal {
    path: PathBuf,
    head_path: PathBuf,
    offsets: Vec<u64>,
    head: Option<Head>,
}

impl Journal {
    /// Open the journal, running the recovery scan. With a verifying key the
    /// scan also checks the final line's signature before trusting it.
    pub fn open(chain_dir: &Path, public: Option<&VerifyingKey>) -> Result<Self, ChainError> {
        let path = chain_dir.join("chain.jsonl");
        let head_path = chain_dir.join("head");
        let mut journal = Self {
            path,
            head_path,
            offsets: Vec::new(),
            head: None,
        };
        journal.recover(public)?;
        Ok(journal)
    }

    fn recover(&mut self, public: Option<&VerifyingKey>) -> Result<(), ChainError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if raw.is_empty() {
            return Ok(());
        }

        let mut offsets = Vec::new();
        let mut pos = 0u64;
        let mut last_line: &str = "";
        for line in raw.split_inclusive('\n') {
            offsets.push(pos);
            pos += line.len() as u64;
            last_line = line.trim_end_matches('\n');
        }

        // A partial append can only damage the final line. Anything earlier
        // is real corruption and stays for `verify` to report.
        if !tail_is_sound(last_line, public) {
            let cut = offsets.pop().ok_or_else(|| {
                ChainError::Corrupt("journal tail unreadable".to_string())
            })?;
            warn!(offset = cut, "truncating partially-written journal tail");
            let file = OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(cut)?;
            file.sync_all()?;
            if offsets.is_empty() {
                self.offsets = offsets;
                self.publish_head(None)?;
                return Ok(());
            }
            let start = *offsets.last().ok_or_else(|| {
                ChainError::Corrupt("journal tail unreadable".to_string())
            })? as usize;
            last_line = raw[start..cut as usize].trim_end_matches('\n');
            if !tail_is_sound(last_line, public) {
                return Err(ChainError::Corrupt(
                    "journal tail unreadable after truncation".to_string(),
                ));
            }
        } else if !raw.ends_with('\n') {
            // Complete final entry that lost its newline in a crash.
            let mut file = OpenOptions::new().append(true).open(&self.path)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }

        let tail = Entry::decode_line(last_line)
            .map_err(|e| ChainError::Corrupt(format!("journal tail: {e}")))?;
        if tail.seq != offsets.len() as u64 - 1 {
            return Err(ChainError::Corrupt(format!(
                "head mismatch: tail seq {} at line {}",
                tail.seq,
                offsets.len() - 1
            )));
        }
        let head = Head {
            seq: tail.seq,
            hash: tail.digest()?,
        };
        self.offsets = offsets;
        self.publish_head(Some(head))?;
        Ok(())
    }

    pub fn head(&self) -> Option<&Head> {
        self.head.as_ref()
    }

    pub fn next_seq(&self) -> u64 {
        self.offsets.len() as u64
    }

    pub fn len(&self) -> u64 {
        self.offsets.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Detect another process having advanced the chain since we opened it.
    /// Called with the writer lock held, before computing the next seq.
    pub fn check_head_unmoved(&self) -> Result<(), ChainError> {
        let on_disk: Option<Head> = match std::fs::read_to_string(&self.head_path) {
            Ok(raw) => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| ChainError::Corrupt(format!("head file: {e}")))?,
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if on_disk != self.head {
            return Err(ChainError::Conflict(
                "chain head advanced outside this handle".to_string(),
            ));
        }
        Ok(())
    }

    /// Append a signed entry: compute seq and prev_hash from the current
    /// head, sign the canonical encoding, write + fsync, publish head.
    pub fn append(&mut self, draft: EntryDraft, key: &WriterKey) -> Result<Entry, ChainError> {
        let seq = self.next_seq();
        let prev_hash = match &self.head {
            Some(head) => head.hash.clone(),
            None => ZERO_DIGEST.to_string(),
        };
        let mut entry = Entry {
            seq,
            prev_hash,
            content_hash: draft.content_hash.clone(),
            payload_ref: draft.content_hash,
            entry_kind: draft.entry_kind,
            tier: draft.tier,
            created_at: draft.created_at,
            provenance: draft.provenance,
            links: draft.links,
            signature: String::new(),
        };
        entry.signature = key.sign(&entry.canonical_bytes()?);

        let line = entry.encode_line()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        let head = Head {
            seq,
            hash: entry.digest()?,
        };
        self.offsets.push(offset);
        self.publish_head(Some(head))?;
        Ok(entry)
    }

    pub fn read(&self, seq: u64) -> Result<Entry, ChainError> {
        let offset = *self
            .offsets
            .get(seq as usize)
            .ok_or(ChainError::UnknownSeq(seq))?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut line = String::new();
        BufReader::new(file).read_line(&mut line)?;
        Entry::decode_line(line.trim_end_matches('\n'))
            .map_err(|e| ChainError::Corrupt(format!("entry {seq}: {e}")))
    }

    /// Sequential scan of the whole journal. Undecodable lines surface as
    /// `Corrupt` items; the iterator keeps going so callers can count them.
    pub fn iter(&self) -> Result<impl Iterator<Item = Result<Entry, ChainError>> + '_, ChainError> {
        let reader = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(reader
            .into_iter()
            .flat_map(|r| r.lines())
            .enumerate()
            .map(|(i, line)| match line {
                Ok(line) => Entry::decode_line(line.trim_end_matches('\n'))
                    .map_err(|e| ChainError::Corrupt(format!("entry {i}: {e}"))),
                Err(e) => Err(e.into()),
            }))
    }

    /// Raw journal lines, for byte-level framing checks.
    pub fn raw_lines(&self) -> Result<Vec<String>, ChainError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(raw.lines().map(str::to_string).collect())
    }

    /// Entries in `from..to` (end exclusive, clamped to the journal length).
    pub fn scan(&self, from: u64, to: u64) -> Result<Vec<Entry>, ChainError> {
        let to = to.min(self.len());
        (from..to).map(|seq| self.read(seq)).collect()
    }

    fn publish_head(&mut self, head: Option<Head>) -> Result<(), ChainError> {
        match &head {
            Some(head) => {
                let tmp = self.head_path.with_extension("tmp");
                let mut file = File::create(&tmp)?;
                file.write_all(serde_json::to_string(head)?.as_bytes())?;
                file.sync_all()?;
                std::fs::rename(&tmp, &self.head_path)?;
            }
            None => {
                if self.head_path.exists() {
                    std::fs::remove_file(&self.head_path)?;
                }
            }
        }
        self.head = head;
        Ok(())
    }
}

fn tail_is_sound(line: &str, public: Option<&VerifyingKey>) -> bool {
    let Ok(entry) = Entry::decode_line(line) else {
        return false;
    };
    match public {
        Some(public) => match entry.canonical_bytes() {
            Ok(bytes) => verify_signature(public, &bytes, &entry.signature),
            Err(_) => false,
        },
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Source;

    fn draft(content_hash: &str) -> EntryDraft {
        EntryDraft {
            content_hash: content_hash.to_string(),
            entry_kind: EntryKind::Memory,
            tier: Tier::Ephemeral,
            created_at: Utc::now(),
            provenance: Provenance {
                source: Source::Manual,
                ..Provenance::default()
            },
            links: Links::default(),
        }
    }

    #[test]
    fn appends_are_linked_and_signed() {
        let dir = tempfile::tempdir().unwrap();
        let key = WriterKey::generate();
        let mut journal = Journal::open(dir.path(), None).unwrap();

        let a = journal.append(draft(&"aa".repeat(32)), &key).unwrap();
        let b = journal.append(draft(&"bb".repeat(32)), &key).unwrap();

        assert_eq!(a.seq, 0);
        assert_eq!(a.prev_hash, ZERO_DIGEST);
        assert_eq!(b.seq, 1);
        assert_eq!(b.prev_hash, a.digest().unwrap());
        assert!(verify_signature(
            &key.verifying_key(),
            &b.canonical_bytes().unwrap(),
            &b.signature
        ));
        assert_eq!(journal.head().unwrap().seq, 1);
    }

    #[test]
    fn reopen_preserves_head_and_reads() {
        let dir = tempfile::tempdir().unwrap();
        let key = WriterKey::generate();
        let public = key.verifying_key();
        {
            let mut journal = Journal::open(dir.path(), None).unwrap();
            journal.append(draft(&"aa".repeat(32)), &key).unwrap();
            journal.append(draft(&"bb".repeat(32)), &key).unwrap();
        }
        let journal = Journal::open(dir.path(), Some(&public)).unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.read(1).unwrap().content_hash, "bb".repeat(32));
        assert!(matches!(
            journal.read(2).unwrap_err(),
            ChainError::UnknownSeq(2)
        ));
    }

    #[test]
    fn partial_tail_line_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let key = WriterKey::generate();
        let public = key.verifying_key();
        {
            let mut journal = Journal::open(dir.path(), None).unwrap();
            journal.append(draft(&"aa".repeat(32)), &key).unwrap();
            journal.append(draft(&"bb".repeat(32)), &key).unwrap();
        }
        // Simulate a crash mid-append: garbage half-line at the tail.
        let path = dir.path().join("chain.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":2,\"prev_ha").unwrap();
        drop(file);

        let journal = Journal::open(dir.path(), Some(&public)).unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.head().unwrap().seq, 1);
        // The file itself is clean again.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.ends_with('\n'));
    }

    #[test]
    fn tail_with_bad_signature_is_truncated_when_key_is_known() {
        let dir = tempfile::tempdir().unwrap();
        let key = WriterKey::generate();
        let public = key.verifying_key();
        {
            let mut journal = Journal::open(dir.path(), None).unwrap();
            journal.append(draft(&"aa".repeat(32)), &key).unwrap();
        }
        // Forge an unsigned tail entry.
        let mut forged = {
            let journal = Journal::open(dir.path(), None).unwrap();
            journal.read(0).unwrap()
        };
        forged.seq = 1;
        forged.signature = "00".repeat(64);
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("chain.jsonl"))
            .unwrap();
        file.write_all(forged.encode_line().unwrap().as_bytes())
            .unwrap();
        file.write_all(b"\n").unwrap();
        drop(file);

        let journal = Journal::open(dir.path(), Some(&public)).unwrap();
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn scan_clamps_to_length() {
        let dir = tempfile::tempdir().unwrap();
        let key = WriterKey::generate();
        let mut journal = Journal::open(dir.path(), None).unwrap();
        for hash in ["aa", "bb", "cc"] {
            journal.append(draft(&hash.repeat(32)), &key).unwrap();
        }
        let entries = journal.scan(1, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 1);
    }

    #[test]
    fn check_head_unmoved_detects_foreign_appends() {
        let dir = tempfile::tempdir().unwrap();
        let key = WriterKey::generate();
        let mut ours = Journal::open(dir.path(), None).unwrap();
        ours.append(draft(&"aa".repeat(32)), &key).unwrap();
        ours.check_head_unmoved().unwrap();

        // Another handle appends behind our back.
        let mut theirs = Journal::open(dir.path(), None).unwrap();
        theirs.append(draft(&"bb".repeat(32)), &key).unwrap();

        assert!(matches!(
            ours.check_head_unmoved().unwrap_err(),
            ChainError::Conflict(_)
        ));
    }
}
