use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use keel_core::{
    BlockLabel, ChainError, CommitOptions, EntryKind, Links, LocalClockBackend, MemoryChain,
    Provenance, RecallOptions, Tier,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keel", about = "Verifiable append-only memory for AI agents")]
struct Cli {
    /// Chain directory; CHAIN_DIR overrides the default.
    #[arg(long, default_value_t = default_chain_dir())]
    dir: String,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the chain directory and generate a keypair if absent
    Init,
    /// Commit a memory entry
    Add {
        content: String,
        #[arg(long, value_enum, default_value_t = KindArg::Memory)]
        kind: KindArg,
        #[arg(long, value_enum, default_value_t = TierArg::Ephemeral)]
        tier: TierArg,
        #[arg(long, default_value_t = 0.5)]
        importance: f64,
        /// Mark as core memory (always offered to context assemblers)
        #[arg(long)]
        core: bool,
    },
    /// Ranked retrieval over the non-superseded frontier
    Recall {
        query: String,
        #[arg(long, default_value_t = 10)]
        max_results: usize,
        #[arg(long)]
        max_tokens: Option<usize>,
        #[arg(long)]
        include_superseded: bool,
    },
    /// Supersede earlier entries with a consolidation
    Rethink {
        #[arg(long, value_delimiter = ',', required = true)]
        supersedes: Vec<u64>,
        content: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Set a labeled context block (persona, user_profile, goals, knowledge)
    BlockSet { label: String, content: String },
    /// Redact an entry's payload, keeping its signed header
    Redact {
        seq: u64,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Inspect one entry: provenance, supersession, anchor receipts
    Introspect { seq: u64 },
    /// Walk the full chain and check every invariant
    Verify,
    /// Rebuild the index from the journal
    Rebuild,
    /// Anchor the current head (or --seq) with a provider
    Anchor {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        seq: Option<u64>,
    },
    /// List anchor receipts
    AnchorStatus {
        #[arg(long)]
        seq: Option<u64>,
    },
    /// Probe pending anchor receipts and persist terminal outcomes
    AnchorUpgrade,
    /// Stream all entries
    Export {
        #[arg(long, value_enum, default_value_t = FormatArg::Json)]
        format: FormatArg,
    },
    /// Head seq plus counts by kind, tier, and decay
    Stats,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Memory,
    Identity,
    Decision,
}

impl From<KindArg> for EntryKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Memory => EntryKind::Memory,
            KindArg::Identity => EntryKind::Identity,
            KindArg::Decision => EntryKind::Decision,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TierArg {
    Committed,
    Relationship,
    Ephemeral,
}

impl From<TierArg> for Tier {
    fn from(value: TierArg) -> Self {
        match value {
            TierArg::Committed => Tier::Committed,
            TierArg::Relationship => Tier::Relationship,
            TierArg::Ephemeral => Tier::Ephemeral,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Markdown,
}

fn default_chain_dir() -> String {
    if let Ok(dir) = std::env::var("CHAIN_DIR") {
        return dir;
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.keel/chain")
}

fn writer_key_path() -> Option<PathBuf> {
    std::env::var("WRITER_KEY_PATH").ok().map(PathBuf::from)
}

/// Stable exit code per error kind.
fn exit_code(err: &ChainError) -> i32 {
    match err.tag() {
        "invalid_input" => 2,
        "unknown_seq" => 3,
        "cyclic_supersede" => 4,
        "write_locked" => 5,
        "signature_failed" => 6,
        "verify_failed" => 7,
        "io_error" => 8,
        "corrupt" => 9,
        "backend_unavailable" => 10,
        "backend_timeout" => 11,
        "conflict" => 12,
        _ => 1,
    }
}

const VERIFY_FAILED_EXIT: i32 = 7;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let dir = PathBuf::from(&cli.dir);
    let key_path = writer_key_path();

    let mut chain = match open_chain(&cli, &dir, key_path.as_deref()) {
        Ok(chain) => chain,
        Err(e) => {
            eprintln!("error[{}]: {e}", e.tag());
            std::process::exit(exit_code(&e));
        }
    };
    chain.register_backend(Box::new(LocalClockBackend));

    match run(&cli, &mut chain) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error[{}]: {e}", e.tag());
            std::process::exit(exit_code(&e));
        }
    }
}

fn open_chain(
    cli: &Cli,
    dir: &Path,
    key_path: Option<&Path>,
) -> Result<MemoryChain, ChainError> {
    match cli.command {
        Command::Init => MemoryChain::init_with(dir, Default::default(), key_path),
        _ => MemoryChain::open_with(dir, Default::default(), key_path),
    }
}

fn run(cli: &Cli, chain: &mut MemoryChain) -> Result<i32, ChainError> {
    match &cli.command {
        Command::Init => {
            if !cli.quiet {
                println!("initialized chain at {}", chain.dir().display());
            }
        }
        Command::Add {
            content,
            kind,
            tier,
            importance,
            core,
        } => {
            let receipt = chain.commit(
                content,
                CommitOptions {
                    entry_kind: (*kind).into(),
                    tier: (*tier).into(),
                    provenance: Provenance {
                        importance: *importance,
                        ..Provenance::default()
                    },
                    links: Links {
                        is_core: *core,
                        ..Links::default()
                    },
                    created_at: None,
                },
            )?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&receipt)?);
            } else if !cli.quiet {
                println!("committed seq {} ({})", receipt.seq, receipt.content_hash);
            }
        }
        Command::Recall {
            query,
            max_results,
            max_tokens,
            include_superseded,
        } => {
            let hits = chain.recall(
                query,
                &RecallOptions {
                    max_tokens: *max_tokens,
                    max_results: Some(*max_results),
                    tiers: None,
                    include_superseded: *include_superseded,
                },
            )?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else if !cli.quiet {
                if hits.is_empty() {
                    println!("no memories found.");
                }
                for hit in &hits {
                    println!(
                        "[{}] seq {} (score {:.3}): {}",
                        hit.kind.as_str(),
                        hit.seq,
                        hit.score,
                        hit.content
                    );
                }
            }
        }
        Command::Rethink {
            supersedes,
            content,
            reason,
        } => {
            let result = chain.rethink(supersedes, content, reason.as_deref())?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if !cli.quiet {
                println!(
                    "consolidated {} entries into seq {}",
                    result.superseded_count, result.consolidation_seq
                );
            }
        }
        Command::BlockSet { label, content } => {
            let label = BlockLabel::parse(label).ok_or_else(|| {
                ChainError::InvalidInput(format!(
                    "unknown block label {label:?} (persona, user_profile, goals, knowledge)"
                ))
            })?;
            let result = chain.block_update(label, content, true)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if !cli.quiet {
                println!(
                    "{} block is now version {} (seq {})",
                    label.as_str(),
                    result.version,
                    result.seq
                );
            }
        }
        Command::Redact { seq, reason } => {
            let receipt = chain.redact(*seq, reason.as_deref())?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&receipt)?);
            } else if !cli.quiet {
                println!("redacted seq {seq} via seq {}", receipt.seq);
            }
        }
        Command::Introspect { seq } => {
            let view = chain.introspect(*seq)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else if !cli.quiet {
                println!(
                    "seq {} [{}] tier {} source {}",
                    view.entry.seq,
                    view.entry.entry_kind.as_str(),
                    view.entry.tier.as_str(),
                    view.source.as_str()
                );
                if let Some(trigger) = &view.trigger {
                    println!("trigger: {trigger}");
                }
                if !view.supersedes.is_empty() {
                    println!("supersedes: {:?}", view.supersedes);
                }
                if let Some(by) = view.superseded_by {
                    println!("superseded by: {by}");
                }
                if view.redacted {
                    println!("redacted: yes");
                }
                if let Some(content) = &view.content {
                    println!("content: {content}");
                }
                for receipt in &view.anchor_receipts {
                    println!(
                        "anchor {}: {}",
                        receipt.provider,
                        receipt.status.as_str()
                    );
                }
            }
        }
        Command::Verify => {
            let report = chain.verify()?;
            if report.ok {
                if !cli.quiet {
                    println!("verify: OK ({} entries)", report.checked);
                }
            } else {
                let failure = report
                    .first_failure
                    .ok_or_else(|| ChainError::Corrupt("failing report without failure".into()))?;
                println!(
                    "verify: FAIL seq={} invariant={} anomalies={}",
                    failure.seq,
                    failure.invariant.as_str(),
                    report.anomalies
                );
                return Ok(VERIFY_FAILED_EXIT);
            }
        }
        Command::Rebuild => {
            let count = chain.rebuild()?;
            if !cli.quiet {
                println!("rebuilt index from {count} journal entries");
            }
        }
        Command::Anchor { provider, seq } => {
            let receipt = chain.anchor(provider, *seq)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&receipt)?);
            } else if !cli.quiet {
                println!(
                    "anchor {} seq {}: {}",
                    receipt.provider,
                    receipt.seq,
                    receipt.status.as_str()
                );
            }
        }
        Command::AnchorStatus { seq } => {
            let receipts = chain.anchor_status(*seq)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&receipts)?);
            } else if !cli.quiet {
                if receipts.is_empty() {
                    println!("no anchor receipts.");
                }
                for receipt in &receipts {
                    println!(
                        "seq {} via {}: {}{}",
                        receipt.seq,
                        receipt.provider,
                        receipt.status.as_str(),
                        receipt
                            .tx_ref
                            .as_deref()
                            .map(|t| format!(" ({t})"))
                            .unwrap_or_default()
                    );
                }
            }
        }
        Command::AnchorUpgrade => {
            let summary = chain.anchor_upgrade()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else if !cli.quiet {
                println!(
                    "checked {}: {} confirmed, {} failed, {} still pending",
                    summary.checked, summary.confirmed, summary.failed, summary.still_pending
                );
            }
        }
        Command::Export { format } => {
            let entries = chain.export()?;
            match format {
                FormatArg::Json => {
                    for item in &entries {
                        println!("{}", serde_json::to_string(item)?);
                    }
                }
                FormatArg::Markdown => {
                    for item in &entries {
                        println!(
                            "## seq {} — {} ({})",
                            item.entry.seq,
                            item.entry.entry_kind.as_str(),
                            item.entry.created_at.to_rfc3339()
                        );
                        println!();
                        println!("{}", item.content.as_deref().unwrap_or("_missing payload_"));
                        println!();
                    }
                }
            }
        }
        Command::Stats => {
            let stats = chain.stats()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else if !cli.quiet {
                match stats.head_seq {
                    Some(head) => println!("head seq: {head} ({} entries)", stats.entries),
                    None => println!("empty chain"),
                }
                let fmt = |pairs: &[(String, u64)]| {
                    pairs
                        .iter()
                        .map(|(k, n)| format!("{k}: {n}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                println!("by kind: {}", fmt(&stats.by_kind));
                println!("by tier: {}", fmt(&stats.by_tier));
                println!("by decay: {}", fmt(&stats.by_decay));
                println!("superseded: {}, core: {}", stats.superseded, stats.core);
            }
        }
    }
    Ok(0)
}
