use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `prev_hash` of the genesis entry.
pub const ZERO_DIGEST: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// The closed set of entry kinds. Adding a kind requires a new verifier rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Memory,
    Identity,
    Decision,
    Redaction,
    Consolidation,
    Block,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Memory => "memory",
            EntryKind::Identity => "identity",
            EntryKind::Decision => "decision",
            EntryKind::Redaction => "redaction",
            EntryKind::Consolidation => "consolidation",
            EntryKind::Block => "block",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "memory" => Some(EntryKind::Memory),
            "identity" => Some(EntryKind::Identity),
            "decision" => Some(EntryKind::Decision),
            "redaction" => Some(EntryKind::Redaction),
            "consolidation" => Some(EntryKind::Consolidation),
            "block" => Some(EntryKind::Block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Committed,
    Relationship,
    Ephemeral,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Committed => "committed",
            Tier::Relationship => "relationship",
            Tier::Ephemeral => "ephemeral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "committed" => Some(Tier::Committed),
            "relationship" => Some(Tier::Relationship),
            "ephemeral" => Some(Tier::Ephemeral),
            _ => None,
        }
    }
}

/// Labels for persistent core-context blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockLabel {
    Persona,
    UserProfile,
    Goals,
    Knowledge,
}

impl BlockLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockLabel::Persona => "persona",
            BlockLabel::UserProfile => "user_profile",
            BlockLabel::Goals => "goals",
            BlockLabel::Knowledge => "knowledge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "persona" => Some(BlockLabel::Persona),
            "user_profile" => Some(BlockLabel::UserProfile),
            "goals" => Some(BlockLabel::Goals),
            "knowledge" => Some(BlockLabel::Knowledge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Manual,
    Auto,
    Consolidation,
    Heartbeat,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Manual => "manual",
            Source::Auto => "auto",
            Source::Consolidation => "consolidation",
            Source::Heartbeat => "heartbeat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Source::Manual),
            "auto" => Some(Source::Auto),
            "consolidation" => Some(Source::Consolidation),
            "heartbeat" => Some(Source::Heartbeat),
            _ => None,
        }
    }
}

/// Where a memory came from and how much it matters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    pub importance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion_tag: Option<String>,
}

impl Default for Provenance {
    fn default() -> Self {
        Self {
            source: Source::Manual,
            trigger: None,
            importance: 0.5,
            emotion_tag: None,
        }
    }
}

/// Edges overlaid on the immutable log: supersession, block lineage, entities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Links {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supersedes: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_label: Option<BlockLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_block_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_entities: Vec<String>,
    #[serde(default)]
    pub is_core: bool,
}

/// One atomic record in the chain. Never rewritten once appended.
///
/// Field order here is the wire order: the canonical encoding is the compact
/// JSON of all fields except `signature`, and the journal line is the same
/// JSON with `signature` appended last. Hashes and signatures are lowercase
/// hex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub seq: u64,
    pub prev_hash: String,
    pub content_hash: String,
    pub payload_ref: String,
    pub entry_kind: EntryKind,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub provenance: Provenance,
    pub links: Links,
    pub signature: String,
}

/// Borrowed view serialized for hashing and signing. Must list the same
/// fields as [`Entry`], minus `signature`, in the same order.
#[derive(Serialize)]
struct CanonicalView<'a> {
    seq: u64,
    prev_hash: &'a str,
    content_hash: &'a str,
    payload_ref: &'a str,
    entry_kind: EntryKind,
    tier: Tier,
    created_at: &'a DateTime<Utc>,
    provenance: &'a Provenance,
    links: &'a Links,
}

impl Entry {
    /// The exact byte sequence that is hashed and signed.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&CanonicalView {
            seq: self.seq,
            prev_hash: &self.prev_hash,
            content_hash: &self.content_hash,
            payload_ref: &self.payload_ref,
            entry_kind: self.entry_kind,
            tier: self.tier,
            created_at: &self.created_at,
            provenance: &self.provenance,
            links: &self.links,
        })
    }

    /// Digest of the canonical encoding; the successor's `prev_hash`.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        Ok(sha256_hex(&self.canonical_bytes()?))
    }

    /// One journal line, without the trailing newline.
    pub fn encode_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode_line(line: &str) -> Result<Entry, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Payload of a `redaction` entry: names the redacted target so the index
/// flag can be reconstructed from the journal alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionPayload {
    pub redacted_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// True for a 64-char lowercase-hex digest. Guards blob paths and head files.
pub fn is_valid_digest(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
