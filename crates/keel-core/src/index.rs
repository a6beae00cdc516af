//! The derived index: a SQLite projection of the journal.
//!
//! The journal is the sole source of truth; every row here is rebuildable
//! from it. Rows are born when an entry is committed, then mutated by recall
//! (access counters), consolidation (supersession flags), and block updates
//! (`block_latest`). Anchor receipts are cached here from their sidecars.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::entry::{BlockLabel, Entry, EntryKind, RedactionPayload, Source, Tier};
use crate::ChainError;

pub struct Index {
    conn: Connection,
}

/// Projected columns for one entry.
#[derive(Debug, Clone)]
pub struct IndexRow {
    pub seq: u64,
    pub kind: EntryKind,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub importance: f64,
    pub source: Source,
    pub trigger: Option<String>,
    pub emotion_tag: Option<String>,
    pub content_hash: String,
    pub block_label: Option<BlockLabel>,
    pub block_version: Option<u32>,
    pub is_core: bool,
    pub is_superseded: bool,
    pub superseded_by: Option<u64>,
    pub redacted: bool,
    pub access_count: i64,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl Index {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ChainError> {
        let conn = Connection::open(path)?;
        let index = Self { conn };
        index.init_schema()?;
        Ok(index)
    }

    pub fn open_in_memory() -> Result<Self, ChainError> {
        let conn = Connection::open_in_memory()?;
        let index = Self { conn };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> Result<(), ChainError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                seq             INTEGER PRIMARY KEY,
                kind            TEXT NOT NULL,
                tier            TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                importance      REAL NOT NULL,
                source          TEXT NOT NULL,
                \"trigger\"      TEXT,
                emotion_tag     TEXT,
                content_hash    TEXT NOT NULL,
                block_label     TEXT,
                block_version   INTEGER,
                is_core         INTEGER NOT NULL DEFAULT 0,
                is_superseded   INTEGER NOT NULL DEFAULT 0,
                superseded_by   INTEGER,
                redacted        INTEGER NOT NULL DEFAULT 0,
                access_count    INTEGER NOT NULL DEFAULT 0,
                last_accessed   TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_entries_kind ON entries(kind);
            CREATE INDEX IF NOT EXISTS idx_entries_block ON entries(block_label);
            CREATE INDEX IF NOT EXISTS idx_entries_superseded ON entries(is_superseded);
            CREATE TABLE IF NOT EXISTS consolidations (
                consolidation_seq INTEGER NOT NULL,
                superseded_seq    INTEGER NOT NULL,
                PRIMARY KEY (consolidation_seq, superseded_seq)
            );
            CREATE TABLE IF NOT EXISTS block_latest (
                label TEXT PRIMARY KEY,
                seq   INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS anchors (
                seq      INTEGER NOT NULL,
                provider TEXT NOT NULL,
                receipt  TEXT NOT NULL,
                PRIMARY KEY (seq, provider)
            );",
        )?;
        Ok(())
    }

    /// Project a journal entry and apply its side effects: supersession
    /// edges, block-latest bumps, redaction flags. The single entry point
    /// shared by commits, the start-up forward-roll, and rebuild.
    pub fn apply(
        &self,
        entry: &Entry,
        redaction: Option<&RedactionPayload>,
    ) -> Result<(), ChainError> {
        self.upsert(entry)?;

        if matches!(entry.entry_kind, EntryKind::Consolidation | EntryKind::Block) {
            for &target in &entry.links.supersedes {
                self.conn.execute(
                    "INSERT OR IGNORE INTO consolidations (consolidation_seq, superseded_seq)
                     VALUES (?1, ?2)",
                    params![entry.seq, target],
                )?;
                self.mark_superseded(target, entry.seq)?;
            }
            // A superseded block may have been some label's latest.
            for &target in &entry.links.supersedes {
                if let Some(row) = self.get(target)? {
                    if row.kind == EntryKind::Block {
                        if let Some(label) = row.block_label {
                            self.recompute_block_latest(label)?;
                        }
                    }
                }
            }
        }

        if entry.entry_kind == EntryKind::Block {
            if let Some(label) = entry.links.block_label {
                self.conn.execute(
                    "INSERT INTO block_latest (label, seq) VALUES (?1, ?2)
                     ON CONFLICT(label) DO UPDATE SET seq = excluded.seq",
                    params![label.as_str(), entry.seq],
                )?;
            }
        }

        if entry.entry_kind == EntryKind::Redaction {
            if let Some(redaction) = redaction {
                self.set_redacted(redaction.redacted_seq)?;
            }
        }

        Ok(())
    }

    pub fn upsert(&self, entry: &Entry) -> Result<(), ChainError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO entries (
                seq, kind, tier, created_at, importance, source, \"trigger\", emotion_tag,
                content_hash, block_label, block_version, is_core
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.seq,
                entry.entry_kind.as_str(),
                entry.tier.as_str(),
                entry.created_at.to_rfc3339(),
                entry.provenance.importance,
                entry.provenance.source.as_str(),
                entry.provenance.trigger,
                entry.provenance.emotion_tag,
                entry.content_hash,
                entry.links.block_label.map(|l| l.as_str()),
                entry.links.block_version,
                entry.links.is_core as i64,
            ],
        )?;
        Ok(())
    }

    /// Flip the supersession flag. The most recent superseder wins, so a
    /// later call simply advances `superseded_by`.
    pub fn mark_superseded(&self, seq: u64, by: u64) -> Result<(), ChainError> {
        self.conn.execute(
            "UPDATE entries SET is_superseded = 1, superseded_by = ?2 WHERE seq = ?1",
            params![seq, by],
        )?;
        Ok(())
    }

    pub fn set_redacted(&self, seq: u64) -> Result<(), ChainError> {
        self.conn
            .execute("UPDATE entries SET redacted = 1 WHERE seq = ?1", params![seq])?;
        Ok(())
    }

    /// Record an access: bump the counter and reset the decay base.
    pub fn touch(&self, seq: u64, now: DateTime<Utc>) -> Result<(), ChainError> {
        self.conn.execute(
            "UPDATE entries SET access_count = access_count + 1, last_accessed = ?2 WHERE seq = ?1",
            params![seq, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get(&self, seq: u64) -> Result<Option<IndexRow>, ChainError> {
        let row = self
            .conn
            .prepare(&format!("{ROW_SELECT} WHERE seq = ?1"))?
            .query_row(params![seq], row_to_index_row)
            .optional()?;
        Ok(row)
    }

    pub fn block_latest(&self, label: BlockLabel) -> Result<Option<u64>, ChainError> {
        let seq = self
            .conn
            .query_row(
                "SELECT seq FROM block_latest WHERE label = ?1",
                params![label.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(seq)
    }

    fn recompute_block_latest(&self, label: BlockLabel) -> Result<(), ChainError> {
        let latest: Option<u64> = self.conn.query_row(
            "SELECT MAX(seq) FROM entries
             WHERE kind = 'block' AND block_label = ?1 AND is_superseded = 0",
            params![label.as_str()],
            |r| r.get(0),
        )?;
        match latest {
            Some(seq) => {
                self.conn.execute(
                    "INSERT INTO block_latest (label, seq) VALUES (?1, ?2)
                     ON CONFLICT(label) DO UPDATE SET seq = excluded.seq",
                    params![label.as_str(), seq],
                )?;
            }
            None => {
                self.conn.execute(
                    "DELETE FROM block_latest WHERE label = ?1",
                    params![label.as_str()],
                )?;
            }
        }
        Ok(())
    }

    /// Non-superseded entries flagged `is_core`, oldest first.
    pub fn core_memories(&self) -> Result<Vec<IndexRow>, ChainError> {
        let mut stmt = self.conn.prepare(&format!(
            "{ROW_SELECT} WHERE is_core = 1 AND is_superseded = 0 AND redacted = 0 ORDER BY seq"
        ))?;
        let rows = stmt.query_map([], row_to_index_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Rows eligible for retrieval scoring. Redacted rows and redaction
    /// entries never qualify; superseded rows only on request. Tier
    /// filtering happens caller-side.
    pub fn candidates(&self, include_superseded: bool) -> Result<Vec<IndexRow>, ChainError> {
        let sql = if include_superseded {
            format!("{ROW_SELECT} WHERE redacted = 0 AND kind != 'redaction'")
        } else {
            format!("{ROW_SELECT} WHERE redacted = 0 AND kind != 'redaction' AND is_superseded = 0")
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_index_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn max_seq(&self) -> Result<Option<u64>, ChainError> {
        let max: Option<u64> = self
            .conn
            .query_row("SELECT MAX(seq) FROM entries", [], |r| r.get(0))?;
        Ok(max)
    }

    /// Targets of one consolidation entry, as recorded in the edge bag.
    pub fn consolidation_targets(&self, consolidation_seq: u64) -> Result<Vec<u64>, ChainError> {
        let mut stmt = self.conn.prepare(
            "SELECT superseded_seq FROM consolidations
             WHERE consolidation_seq = ?1 ORDER BY superseded_seq",
        )?;
        let rows = stmt.query_map(params![consolidation_seq], |r| r.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn counts_by_kind(&self) -> Result<Vec<(String, u64)>, ChainError> {
        self.grouped_counts("SELECT kind, COUNT(*) FROM entries GROUP BY kind ORDER BY kind")
    }

    pub fn counts_by_tier(&self) -> Result<Vec<(String, u64)>, ChainError> {
        self.grouped_counts("SELECT tier, COUNT(*) FROM entries GROUP BY tier ORDER BY tier")
    }

    fn grouped_counts(&self, sql: &str) -> Result<Vec<(String, u64)>, ChainError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn superseded_count(&self) -> Result<u64, ChainError> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE is_superseded = 1",
            [],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    pub fn core_count(&self) -> Result<u64, ChainError> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE is_core = 1 AND is_superseded = 0",
            [],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// `(created_at, last_accessed)` of every row, for decay-tier counting.
    pub fn access_times(&self) -> Result<Vec<(DateTime<Utc>, Option<DateTime<Utc>>)>, ChainError> {
        let mut stmt = self
            .conn
            .prepare("SELECT created_at, last_accessed FROM entries")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (created, accessed) = row?;
            out.push((parse_datetime(&created)?, accessed.as_deref().map(parse_datetime).transpose()?));
        }
        Ok(out)
    }

    /// Drop all derived state. Rebuild repopulates from the journal.
    pub fn clear(&self) -> Result<(), ChainError> {
        self.conn.execute_batch(
            "DELETE FROM entries;
             DELETE FROM consolidations;
             DELETE FROM block_latest;
             DELETE FROM anchors;",
        )?;
        Ok(())
    }

    pub fn cache_anchor(&self, seq: u64, provider: &str, receipt_json: &str) -> Result<(), ChainError> {
        self.conn.execute(
            "INSERT INTO anchors (seq, provider, receipt) VALUES (?1, ?2, ?3)
             ON CONFLICT(seq, provider) DO UPDATE SET receipt = excluded.receipt",
            params![seq, provider, receipt_json],
        )?;
        Ok(())
    }

    pub fn cached_anchors(&self, seq: Option<u64>) -> Result<Vec<String>, ChainError> {
        let mut out = Vec::new();
        match seq {
            Some(seq) => {
                let mut stmt = self.conn.prepare(
                    "SELECT receipt FROM anchors WHERE seq = ?1 ORDER BY provider",
                )?;
                let rows = stmt.query_map(params![seq], |r| r.get(0))?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT receipt FROM anchors ORDER BY seq, provider")?;
                let rows = stmt.query_map([], |r| r.get(0))?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }
}

const ROW_SELECT: &str = "SELECT seq, kind, tier, created_at, importance, source, \"trigger\",
        emotion_tag, content_hash, block_label, block_version, is_core,
        is_superseded, superseded_by, redacted, access_count, last_accessed
 FROM entries";

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, ChainError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ChainError::Corrupt(format!("bad timestamp in index: {e}")))
}

fn row_to_index_row(row: &rusqlite::Row) -> rusqlite::Result<IndexRow> {
    let kind: String = row.get(1)?;
    let tier: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    let source: String = row.get(5)?;
    let block_label: Option<String> = row.get(9)?;
    let last_accessed: Option<String> = row.get(16)?;
    let bad = |what: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unrecognized {what}").into(),
        )
    };
    Ok(IndexRow {
        seq: row.get(0)?,
        kind: EntryKind::parse(&kind).ok_or_else(|| bad("kind"))?,
        tier: Tier::parse(&tier).ok_or_else(|| bad("tier"))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|_| bad("created_at"))?
            .with_timezone(&Utc),
        importance: row.get(4)?,
        source: Source::parse(&source).ok_or_else(|| bad("source"))?,
        trigger: row.get(6)?,
        emotion_tag: row.get(7)?,
        content_hash: row.get(8)?,
        block_label: block_label
            .map(|l| BlockLabel::parse(&l).ok_or_else(|| bad("block_label")))
            .transpose()?,
        block_version: row.get(10)?,
        is_core: row.get::<_, i64>(11)? != 0,
        is_superseded: row.get::<_, i64>(12)? != 0,
        superseded_by: row.get(13)?,
        redacted: row.get::<_, i64>(14)? != 0,
        access_count: row.get(15)?,
        last_accessed: last_accessed
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|_| bad("last_accessed"))
            })
            .transpose()?,
    })
}
