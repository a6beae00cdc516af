//! Content-addressed blob store.
//!
//! Blobs live under `content/<hh>/<digest>`, sharded by the first byte of
//! the digest. Writes go through a temp file and an atomic rename keyed by
//! the final digest, so duplicate puts are no-ops and a crashed put leaves
//! no partial blob behind.

use std::fs;
use std::path::{Path, PathBuf};

use unicode_normalization::UnicodeNormalization;

use crate::entry::{is_valid_digest, sha256_hex};
use crate::ChainError;

/// What a redacted blob is overwritten with. The digest-named file and the
/// signed chain header stay in place.
pub const REDACTION_SENTINEL: &str = "[redacted]";

/// Normalize payload text before hashing: UTF-8 NFC, trailing newlines
/// trimmed. Benign re-encodings of the same text hash to the same blob.
pub fn normalize(text: &str) -> String {
    text.nfc().collect::<String>().trim_end_matches('\n').to_string()
}

/// Digest of a normalized payload; blob key and `content_hash` both.
pub fn content_digest(normalized: &str) -> String {
    sha256_hex(normalized.as_bytes())
}

pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn open(chain_dir: &Path) -> Result<Self, ChainError> {
        let root = chain_dir.join("content");
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Store a normalized payload, returning its digest. Idempotent.
    pub fn put(&self, normalized: &str) -> Result<String, ChainError> {
        let digest = content_digest(normalized);
        let path = self.blob_path(&digest)?;
        if path.exists() {
            return Ok(digest);
        }
        let shard = path.parent().ok_or_else(|| {
            ChainError::Corrupt(format!("blob path has no parent: {}", path.display()))
        })?;
        fs::create_dir_all(shard)?;
        let tmp = shard.join(format!(".tmp-{digest}"));
        fs::write(&tmp, normalized.as_bytes())?;
        fs::rename(&tmp, &path)?;
        Ok(digest)
    }

    /// Fetch a blob. `Ok(None)` when no blob exists under the digest.
    pub fn get(&self, digest: &str) -> Result<Option<String>, ChainError> {
        let path = self.blob_path(digest)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, digest: &str) -> Result<bool, ChainError> {
        Ok(self.blob_path(digest)?.exists())
    }

    /// Overwrite a blob in place with the redaction sentinel. The file keeps
    /// its digest name; only the payload bytes are destroyed.
    pub fn redact(&self, digest: &str) -> Result<(), ChainError> {
        let path = self.blob_path(digest)?;
        if !path.exists() {
            return Err(ChainError::Corrupt(format!("no blob to redact: {digest}")));
        }
        let shard = path.parent().ok_or_else(|| {
            ChainError::Corrupt(format!("blob path has no parent: {}", path.display()))
        })?;
        let tmp = shard.join(format!(".tmp-{digest}"));
        fs::write(&tmp, REDACTION_SENTINEL.as_bytes())?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf, ChainError> {
        if !is_valid_digest(digest) {
            return Err(ChainError::InvalidInput(format!("bad digest: {digest:?}")));
        }
        Ok(self.root.join(&digest[..2]).join(digest))
    }
}
