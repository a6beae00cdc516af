//! Anchoring: binding chain state to external timestamping authorities.
//!
//! Backends are the only asynchronous surface of the system, modeled as
//! request/response with an explicit later-verify step. No core write path
//! ever waits on a backend. Receipts are persisted to per-provider sidecar
//! files next to the journal; a successful submit leaves exactly one
//! `pending` receipt behind, and the upgrade pass atomically replaces it
//! with its terminal state.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::entry::Entry;
use crate::ChainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorStatus {
    Pending,
    Confirmed,
    Failed,
}

impl AnchorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorStatus::Pending => "pending",
            AnchorStatus::Confirmed => "confirmed",
            AnchorStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AnchorStatus::Pending)
    }
}

/// Persisted record of one anchoring attempt for one entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorReceipt {
    pub seq: u64,
    pub provider: String,
    pub status: AnchorStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AnchorOptions {
    /// Budget for one backend call. Backends must give up within it.
    pub timeout: Duration,
}

impl Default for AnchorOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// What a backend returns from a successful submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub tx_ref: Option<String>,
}

/// Outcome of one verification probe.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub status: AnchorStatus,
    pub block_number: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostEstimate {
    pub fee: f64,
    pub available: bool,
}

/// One anchoring provider. Submission failures are expressed through
/// `ChainError::BackendUnavailable` / `BackendTimeout`; the registry turns
/// them into persisted `failed` receipts rather than surfacing them to
/// write paths.
pub trait AnchorBackend: Send {
    fn provider(&self) -> &str;
    fn is_available(&self) -> bool;
    fn submit(&self, entry: &Entry, options: &AnchorOptions) -> Result<Submission, ChainError>;
    fn verify(
        &self,
        receipt: &AnchorReceipt,
        options: &AnchorOptions,
    ) -> Result<VerifyOutcome, ChainError>;
    fn estimate_cost(&self, count: usize) -> CostEstimate;
}

/// Built-in provider backed by nothing but the local clock. Useful as a
/// stand-in authority for demos and for exercising the receipt lifecycle;
/// a real deployment registers a network backend instead.
pub struct LocalClockBackend;

impl AnchorBackend for LocalClockBackend {
    fn provider(&self) -> &str {
        "local"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn submit(&self, entry: &Entry, _options: &AnchorOptions) -> Result<Submission, ChainError> {
        Ok(Submission {
            tx_ref: Some(format!("local-{}-{}", entry.seq, &entry.content_hash[..8])),
        })
    }

    fn verify(
        &self,
        _receipt: &AnchorReceipt,
        _options: &AnchorOptions,
    ) -> Result<VerifyOutcome, ChainError> {
        Ok(VerifyOutcome {
            status: AnchorStatus::Confirmed,
            block_number: None,
            timestamp: Some(Utc::now()),
            error: None,
        })
    }

    fn estimate_cost(&self, _count: usize) -> CostEstimate {
        CostEstimate {
            fee: 0.0,
            available: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpgradeSummary {
    pub checked: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub still_pending: usize,
}

pub struct AnchorRegistry {
    dir: PathBuf,
    backends: Vec<Box<dyn AnchorBackend>>,
}

impl AnchorRegistry {
    pub fn open(chain_dir: &Path) -> Result<Self, ChainError> {
        let dir = chain_dir.join("anchors");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            backends: Vec::new(),
        })
    }

    /// Register a backend. Idempotent by provider tag: a re-registration
    /// replaces the previous backend.
    pub fn register(&mut self, backend: Box<dyn AnchorBackend>) {
        let tag = backend.provider().to_string();
        self.backends.retain(|b| b.provider() != tag);
        self.backends.push(backend);
    }

    pub fn providers(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.provider()).collect()
    }

    fn backend(&self, provider: &str) -> Result<&dyn AnchorBackend, ChainError> {
        self.backends
            .iter()
            .find(|b| b.provider() == provider)
            .map(|b| b.as_ref())
            .ok_or_else(|| {
                ChainError::BackendUnavailable(format!("no such provider: {provider}"))
            })
    }

    pub fn estimate_cost(&self, provider: &str, count: usize) -> Result<CostEstimate, ChainError> {
        Ok(self.backend(provider)?.estimate_cost(count))
    }

    /// Submit one entry to one provider. A backend failure yields a
    /// persisted `failed` receipt, not an error — anchoring problems never
    /// block the chain.
    pub fn submit(
        &self,
        provider: &str,
        entry: &Entry,
        options: &AnchorOptions,
    ) -> Result<AnchorReceipt, ChainError> {
        let backend = self.backend(provider)?;
        let submitted_at = Utc::now();
        let receipt = if !backend.is_available() {
            warn!(provider, seq = entry.seq, "backend unavailable at submit");
            AnchorReceipt {
                seq: entry.seq,
                provider: provider.to_string(),
                status: AnchorStatus::Failed,
                submitted_at,
                tx_ref: None,
                block_number: None,
                timestamp: None,
                error: Some("backend unavailable".to_string()),
                verified_at: None,
            }
        } else {
            match backend.submit(entry, options) {
                Ok(submission) => {
                    info!(provider, seq = entry.seq, "anchor submitted");
                    AnchorReceipt {
                        seq: entry.seq,
                        provider: provider.to_string(),
                        status: AnchorStatus::Pending,
                        submitted_at,
                        tx_ref: submission.tx_ref,
                        block_number: None,
                        timestamp: None,
                        error: None,
                        verified_at: None,
                    }
                }
                Err(e) => {
                    warn!(provider, seq = entry.seq, error = %e, "anchor submission failed");
                    AnchorReceipt {
                        seq: entry.seq,
                        provider: provider.to_string(),
                        status: AnchorStatus::Failed,
                        submitted_at,
                        tx_ref: None,
                        block_number: None,
                        timestamp: None,
                        error: Some(e.to_string()),
                        verified_at: None,
                    }
                }
            }
        };
        self.persist(&receipt)?;
        Ok(receipt)
    }

    /// All receipts, or those for one seq, across every provider sidecar.
    pub fn receipts(&self, seq: Option<u64>) -> Result<Vec<AnchorReceipt>, ChainError> {
        let mut out = Vec::new();
        for path in self.sidecar_paths()? {
            let mut receipts = self.load_sidecar(&path)?;
            if let Some(seq) = seq {
                receipts.retain(|r| r.seq == seq);
            }
            out.append(&mut receipts);
        }
        out.sort_by(|a, b| a.seq.cmp(&b.seq).then(a.provider.cmp(&b.provider)));
        Ok(out)
    }

    /// Walk pending receipts and probe their backends. Idempotent: terminal
    /// receipts are never touched, so re-running is a no-op.
    pub fn upgrade(&self, options: &AnchorOptions) -> Result<UpgradeSummary, ChainError> {
        let mut summary = UpgradeSummary::default();
        for receipt in self.receipts(None)? {
            if receipt.status.is_terminal() {
                continue;
            }
            summary.checked += 1;
            let backend = match self.backend(&receipt.provider) {
                Ok(backend) => backend,
                Err(_) => {
                    // Provider not registered this run; leave the receipt.
                    summary.still_pending += 1;
                    continue;
                }
            };
            match backend.verify(&receipt, options) {
                Ok(outcome) if outcome.status.is_terminal() => {
                    let upgraded = AnchorReceipt {
                        status: outcome.status,
                        block_number: outcome.block_number,
                        timestamp: outcome.timestamp,
                        error: outcome.error,
                        verified_at: Some(Utc::now()),
                        ..receipt
                    };
                    info!(
                        provider = %upgraded.provider,
                        seq = upgraded.seq,
                        status = upgraded.status.as_str(),
                        "anchor receipt upgraded"
                    );
                    match upgraded.status {
                        AnchorStatus::Confirmed => summary.confirmed += 1,
                        AnchorStatus::Failed => summary.failed += 1,
                        AnchorStatus::Pending => {}
                    }
                    self.persist(&upgraded)?;
                }
                Ok(_) => summary.still_pending += 1,
                Err(e) => {
                    warn!(provider = %receipt.provider, seq = receipt.seq, error = %e, "verify probe failed");
                    summary.still_pending += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Insert or replace the `(seq, provider)` receipt in its sidecar.
    fn persist(&self, receipt: &AnchorReceipt) -> Result<(), ChainError> {
        let path = self.sidecar_path(&receipt.provider)?;
        let mut receipts = if path.exists() {
            self.load_sidecar(&path)?
        } else {
            Vec::new()
        };
        receipts.retain(|r| r.seq != receipt.seq);
        receipts.push(receipt.clone());
        receipts.sort_by_key(|r| r.seq);

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&receipts)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn sidecar_path(&self, provider: &str) -> Result<PathBuf, ChainError> {
        if provider.is_empty()
            || !provider
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ChainError::InvalidInput(format!(
                "bad provider tag: {provider:?}"
            )));
        }
        Ok(self.dir.join(format!("{provider}.json")))
    }

    fn sidecar_paths(&self) -> Result<Vec<PathBuf>, ChainError> {
        let mut paths = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if path.extension().is_some_and(|e| e == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn load_sidecar(&self, path: &Path) -> Result<Vec<AnchorReceipt>, ChainError> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| ChainError::Corrupt(format!("anchor sidecar {}: {e}", path.display())))
    }
}
