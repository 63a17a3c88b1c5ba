//! SQLite-backed storage engine.
//!
//! One wide `bars` table keyed (symbol, timeframe, timestamp) with the
//! simulation label columns inline, a triples table for indicator
//! values, and a rejection log feeding the quality report. Batched
//! writes run in transactions so a crash mid-batch leaves the pre-batch
//! state. Migrations are tracked by a monotonic version; a store newer
//! than the binary refuses to open.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::indicators::IndicatorValue;
use crate::models::{
    Bar, ExitReason, SimulationLabel, Timeframe, TradeOutcome, TradingSession,
};
use crate::validator::ValidatedBar;

/// Highest schema version this binary can operate.
pub const LATEST_SCHEMA_VERSION: i64 = 2;

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;
"#;

/// Ordered migrations; each entry runs inside its own transaction.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
CREATE TABLE IF NOT EXISTS bars (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume INTEGER NOT NULL,
    source TEXT NOT NULL,
    ingested_at INTEGER NOT NULL,
    quality_score REAL NOT NULL,
    session TEXT NOT NULL,
    is_regular_hours INTEGER NOT NULL,
    label_entry_price REAL,
    label_stop_price REAL,
    label_take_price REAL,
    label_shares INTEGER,
    label_exit_timestamp INTEGER,
    label_exit_price REAL,
    label_exit_reason TEXT,
    label_bars_to_exit INTEGER,
    label_pnl REAL,
    label_outcome TEXT,
    PRIMARY KEY (symbol, timeframe, timestamp)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_bars_timestamp ON bars(timestamp);
CREATE INDEX IF NOT EXISTS idx_bars_regular ON bars(symbol, is_regular_hours);
CREATE INDEX IF NOT EXISTS idx_bars_quality ON bars(quality_score);

CREATE TABLE IF NOT EXISTS rejections (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    code TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    recorded_at INTEGER NOT NULL,
    PRIMARY KEY (symbol, timeframe, timestamp, code)
) WITHOUT ROWID;
"#,
    ),
    (
        2,
        r#"
CREATE TABLE IF NOT EXISTS indicator_values (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    family TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    value REAL,
    valid INTEGER NOT NULL,
    PRIMARY KEY (symbol, timeframe, timestamp, family, fingerprint)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_indicator_fingerprint
    ON indicator_values(fingerprint, symbol, timeframe, timestamp);
"#,
    ),
];

// =============================================================================
// ROW TYPES & REPORTS
// =============================================================================

/// A stored bar plus its persisted metadata.
#[derive(Debug, Clone, Serialize)]
pub struct BarRow {
    pub bar: Bar,
    pub quality_score: f64,
    pub session: TradingSession,
}

/// Read filters for range queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryFilters {
    pub regular_hours_only: bool,
    pub min_quality: Option<f64>,
}

/// What one bulk upsert did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub unchanged: usize,
    pub replaced: usize,
    pub kept_existing: usize,
    /// Conflicting-duplicate warnings, one per disagreement.
    pub conflicts: Vec<String>,
}

/// Grid completeness over a range.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MissingReport {
    pub expected: usize,
    pub found: usize,
    pub missing: Vec<DateTime<Utc>>,
    /// Stored rows whose timestamps sit off the canonical grid.
    pub misaligned: Vec<DateTime<Utc>>,
}

impl MissingReport {
    pub fn completeness_pct(&self) -> f64 {
        if self.expected == 0 {
            100.0
        } else {
            (self.found.min(self.expected)) as f64 / self.expected as f64 * 100.0
        }
    }
}

/// Aggregate quality over stored and rejected rows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreQualityReport {
    pub total_bars: usize,
    pub score_mean: f64,
    pub score_min: f64,
    pub regular_hours_bars: usize,
    pub labeled_bars: usize,
    pub rejected_count: usize,
    pub rejections_by_code: std::collections::BTreeMap<String, usize>,
}

// =============================================================================
// STORE
// =============================================================================

/// The single writer of durable state. Every mutation in the system
/// goes through this handle.
#[derive(Clone)]
pub struct BarStore {
    conn: Arc<Mutex<Connection>>,
}

impl BarStore {
    pub fn open(path: &str, expected_schema_version: i64) -> Result<Self, ErrorKind> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path, flags)
            .map_err(|e| ErrorKind::StoreIoError(format!("open {path}: {e}")))?;
        Self::from_connection(conn, expected_schema_version)
    }

    pub fn open_in_memory() -> Result<Self, ErrorKind> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ErrorKind::StoreIoError(format!("open :memory:: {e}")))?;
        Self::from_connection(conn, LATEST_SCHEMA_VERSION)
    }

    fn from_connection(conn: Connection, expected_schema_version: i64) -> Result<Self, ErrorKind> {
        conn.execute_batch(PRAGMAS)
            .map_err(|e| ErrorKind::StoreIoError(format!("pragmas: {e}")))?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.migrate(expected_schema_version)?;
        Ok(store)
    }

    fn migrate(&self, expected_schema_version: i64) -> Result<(), ErrorKind> {
        let mut conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL PRIMARY KEY)",
            [],
        )
        .map_err(io_err)?;

        let current: i64 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))
            .map_err(io_err)?;

        if current > LATEST_SCHEMA_VERSION || current > expected_schema_version {
            return Err(ErrorKind::StoreConflict(format!(
                "store schema version {current} is newer than this binary supports \
                 ({expected_schema_version})"
            )));
        }

        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            let tx = conn.transaction().map_err(io_err)?;
            tx.execute_batch(sql).map_err(io_err)?;
            tx.execute("INSERT INTO schema_version (version) VALUES (?1)", params![version])
                .map_err(io_err)?;
            tx.commit().map_err(io_err)?;
            info!(version, "applied storage migration");
        }
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64, ErrorKind> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))
            .map_err(io_err)
    }

    // =========================================================================
    // BARS
    // =========================================================================

    /// Atomic batched upsert. Conflict policy: identical content is a
    /// no-op; differing content keeps whichever side carries the higher
    /// quality score and records a warning. Replacing a bar invalidates
    /// its label and indicator rows.
    pub fn bulk_upsert(&self, bars: &[ValidatedBar]) -> Result<UpsertOutcome, ErrorKind> {
        let mut outcome = UpsertOutcome::default();
        if bars.is_empty() {
            return Ok(outcome);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(io_err)?;
        {
            for validated in bars {
                let bar = &validated.bar;
                // The validator filters these out; reaching here with a
                // malformed bar means an upstream component skipped it.
                if let Err(reason) = bar.check_invariants() {
                    return Err(ErrorKind::InternalInvariant(format!(
                        "{}/{}/{}: {reason}",
                        bar.symbol, bar.timeframe, bar.timestamp
                    )));
                }
                let score = validated.quality.score;
                let existing: Option<(f64, f64, f64, f64, i64, f64)> = tx
                    .query_row(
                        "SELECT open, high, low, close, volume, quality_score
                         FROM bars WHERE symbol = ?1 AND timeframe = ?2 AND timestamp = ?3",
                        params![bar.symbol, bar.timeframe.as_str(), bar.timestamp.timestamp()],
                        |r| {
                            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
                        },
                    )
                    .optional()
                    .map_err(io_err)?;

                match existing {
                    None => {
                        tx.execute(
                            "INSERT INTO bars (symbol, timeframe, timestamp, open, high, low,
                                close, volume, source, ingested_at, quality_score, session,
                                is_regular_hours)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                            params![
                                bar.symbol,
                                bar.timeframe.as_str(),
                                bar.timestamp.timestamp(),
                                bar.open,
                                bar.high,
                                bar.low,
                                bar.close,
                                bar.volume,
                                bar.source,
                                bar.ingested_at.timestamp(),
                                score,
                                bar.session().as_str(),
                                bar.is_regular_hours() as i64,
                            ],
                        )
                        .map_err(io_err)?;
                        outcome.inserted += 1;
                    }
                    Some((open, high, low, close, volume, existing_score)) => {
                        let identical = open == bar.open
                            && high == bar.high
                            && low == bar.low
                            && close == bar.close
                            && volume == bar.volume;
                        if identical {
                            outcome.unchanged += 1;
                            continue;
                        }
                        let warning = format!(
                            "conflicting duplicate for {}/{}/{}: stored score {existing_score}, \
                             incoming score {score}",
                            bar.symbol, bar.timeframe, bar.timestamp
                        );
                        outcome.conflicts.push(warning);
                        if score > existing_score {
                            tx.execute(
                                "UPDATE bars SET open = ?4, high = ?5, low = ?6, close = ?7,
                                    volume = ?8, source = ?9, ingested_at = ?10,
                                    quality_score = ?11,
                                    label_entry_price = NULL, label_stop_price = NULL,
                                    label_take_price = NULL, label_shares = NULL,
                                    label_exit_timestamp = NULL, label_exit_price = NULL,
                                    label_exit_reason = NULL, label_bars_to_exit = NULL,
                                    label_pnl = NULL, label_outcome = NULL
                                 WHERE symbol = ?1 AND timeframe = ?2 AND timestamp = ?3",
                                params![
                                    bar.symbol,
                                    bar.timeframe.as_str(),
                                    bar.timestamp.timestamp(),
                                    bar.open,
                                    bar.high,
                                    bar.low,
                                    bar.close,
                                    bar.volume,
                                    bar.source,
                                    bar.ingested_at.timestamp(),
                                    score,
                                ],
                            )
                            .map_err(io_err)?;
                            // A corrected bar invalidates its derived rows.
                            tx.execute(
                                "DELETE FROM indicator_values
                                 WHERE symbol = ?1 AND timeframe = ?2 AND timestamp = ?3",
                                params![
                                    bar.symbol,
                                    bar.timeframe.as_str(),
                                    bar.timestamp.timestamp()
                                ],
                            )
                            .map_err(io_err)?;
                            outcome.replaced += 1;
                        } else {
                            outcome.kept_existing += 1;
                        }
                    }
                }
            }
        }
        tx.commit().map_err(io_err)?;
        debug!(
            inserted = outcome.inserted,
            unchanged = outcome.unchanged,
            replaced = outcome.replaced,
            kept = outcome.kept_existing,
            "bulk upsert committed"
        );
        Ok(outcome)
    }

    /// Record the issues of rejected bars so the quality report can
    /// count them. Idempotent per (bar, code).
    pub fn record_rejections(&self, rejected: &[ValidatedBar]) -> Result<usize, ErrorKind> {
        if rejected.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(io_err)?;
        let mut recorded = 0usize;
        {
            for validated in rejected {
                let bar = &validated.bar;
                for issue in &validated.quality.issues {
                    recorded += tx
                        .execute(
                            "INSERT OR IGNORE INTO rejections
                                (symbol, timeframe, timestamp, code, severity, message, recorded_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                            params![
                                bar.symbol,
                                bar.timeframe.as_str(),
                                bar.timestamp.timestamp(),
                                issue.code.as_str(),
                                issue.severity.as_str(),
                                issue.message,
                                Utc::now().timestamp(),
                            ],
                        )
                        .map_err(io_err)?;
                }
            }
        }
        tx.commit().map_err(io_err)?;
        Ok(recorded)
    }

    /// Range scan in timestamp order.
    pub fn query(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        filters: QueryFilters,
    ) -> Result<Vec<BarRow>, ErrorKind> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT symbol, timeframe, timestamp, open, high, low, close, volume, source,
                        ingested_at, quality_score, session, is_regular_hours
                 FROM bars
                 WHERE symbol = ?1 AND timeframe = ?2 AND timestamp >= ?3 AND timestamp < ?4
                 ORDER BY timestamp",
            )
            .map_err(io_err)?;
        let rows = stmt
            .query_map(
                params![
                    symbol,
                    timeframe.as_str(),
                    range_start.timestamp(),
                    range_end.timestamp()
                ],
                row_to_bar,
            )
            .map_err(io_err)?
            .collect::<Result<Vec<BarRow>, _>>()
            .map_err(io_err)?;

        Ok(rows
            .into_iter()
            .filter(|row| {
                (!filters.regular_hours_only || row.session == TradingSession::Regular)
                    && filters.min_quality.map_or(true, |q| row.quality_score >= q)
            })
            .collect())
    }

    /// Newest committed timestamp for a key, for crash resume.
    pub fn last_committed_timestamp(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<DateTime<Utc>>, ErrorKind> {
        let conn = self.conn.lock();
        let ts: Option<i64> = conn
            .query_row(
                "SELECT MAX(timestamp) FROM bars WHERE symbol = ?1 AND timeframe = ?2",
                params![symbol, timeframe.as_str()],
                |r| r.get(0),
            )
            .map_err(io_err)?;
        Ok(ts.map(|t| Utc.timestamp_opt(t, 0).unwrap()))
    }

    /// Exact missing-slot detection over the canonical regular-session
    /// grid; off-grid stored rows are reported separately.
    pub fn detect_missing(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<MissingReport, ErrorKind> {
        let stored = self.query(symbol, timeframe, range_start, range_end, QueryFilters::default())?;
        let stored_set: HashSet<DateTime<Utc>> =
            stored.iter().map(|row| row.bar.timestamp).collect();

        let mut expected = Vec::new();
        let mut day = range_start;
        while day < range_end + Duration::days(1) {
            for slot in timeframe.regular_session_slots(day) {
                if slot >= range_start && slot < range_end {
                    expected.push(slot);
                }
            }
            day += Duration::days(1);
        }
        expected.sort();
        expected.dedup();

        let missing: Vec<DateTime<Utc>> =
            expected.iter().copied().filter(|slot| !stored_set.contains(slot)).collect();
        let misaligned: Vec<DateTime<Utc>> = stored
            .iter()
            .map(|row| row.bar.timestamp)
            .filter(|ts| !timeframe.is_on_grid(*ts))
            .collect();

        let found = expected.len() - missing.len();
        Ok(MissingReport { expected: expected.len(), found, missing, misaligned })
    }

    /// Aggregate quality over a range, rejected rows included.
    pub fn quality_report(
        &self,
        symbol: Option<&str>,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<StoreQualityReport, ErrorKind> {
        let conn = self.conn.lock();
        let symbol_filter = symbol.unwrap_or("%").to_string();

        let (total, mean, min, regular, labeled): (usize, f64, f64, usize, usize) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(AVG(quality_score), 0.0),
                        COALESCE(MIN(quality_score), 0.0),
                        COALESCE(SUM(is_regular_hours), 0),
                        COALESCE(SUM(label_exit_reason IS NOT NULL), 0)
                 FROM bars
                 WHERE symbol LIKE ?1 AND timestamp >= ?2 AND timestamp < ?3",
                params![symbol_filter, range_start.timestamp(), range_end.timestamp()],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)? as usize,
                        r.get(1)?,
                        r.get(2)?,
                        r.get::<_, i64>(3)? as usize,
                        r.get::<_, i64>(4)? as usize,
                    ))
                },
            )
            .map_err(io_err)?;

        let mut rejections_by_code = std::collections::BTreeMap::new();
        let mut stmt = conn
            .prepare_cached(
                "SELECT code, COUNT(*) FROM rejections
                 WHERE symbol LIKE ?1 AND timestamp >= ?2 AND timestamp < ?3
                 GROUP BY code",
            )
            .map_err(io_err)?;
        let mut rejected_count = 0usize;
        let rows = stmt
            .query_map(
                params![symbol_filter, range_start.timestamp(), range_end.timestamp()],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as usize)),
            )
            .map_err(io_err)?;
        for row in rows {
            let (code, count) = row.map_err(io_err)?;
            rejected_count += count;
            rejections_by_code.insert(code, count);
        }

        Ok(StoreQualityReport {
            total_bars: total,
            score_mean: mean,
            score_min: if total == 0 { 0.0 } else { min },
            regular_hours_bars: regular,
            labeled_bars: labeled,
            rejected_count,
            rejections_by_code,
        })
    }

    // =========================================================================
    // LABELS
    // =========================================================================

    /// Idempotent label write. Labels attach only to stored bars; a
    /// label without its bar is skipped with a warning.
    pub fn mark_labels(&self, labels: &[SimulationLabel]) -> Result<usize, ErrorKind> {
        if labels.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(io_err)?;
        let mut written = 0usize;
        {
            for label in labels {
                let updated = tx
                    .execute(
                        "UPDATE bars SET
                            label_entry_price = ?4, label_stop_price = ?5,
                            label_take_price = ?6, label_shares = ?7,
                            label_exit_timestamp = ?8, label_exit_price = ?9,
                            label_exit_reason = ?10, label_bars_to_exit = ?11,
                            label_pnl = ?12, label_outcome = ?13
                         WHERE symbol = ?1 AND timeframe = ?2 AND timestamp = ?3",
                        params![
                            label.symbol,
                            label.timeframe.as_str(),
                            label.entry_timestamp.timestamp(),
                            label.entry_price,
                            label.stop_price,
                            label.take_price,
                            label.shares,
                            label.exit_timestamp.map(|t| t.timestamp()),
                            label.exit_price,
                            label.exit_reason.as_str(),
                            label.bars_to_exit,
                            label.pnl,
                            label.outcome.map(|o| o.as_str()),
                        ],
                    )
                    .map_err(io_err)?;
                if updated == 0 {
                    warn!(
                        symbol = %label.symbol,
                        timeframe = %label.timeframe,
                        timestamp = %label.entry_timestamp,
                        "label for unstored bar skipped"
                    );
                } else {
                    written += 1;
                }
            }
        }
        tx.commit().map_err(io_err)?;
        Ok(written)
    }

    /// Labels over a range, across all timeframes of the symbol.
    pub fn get_labels(
        &self,
        symbol: &str,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Vec<SimulationLabel>, ErrorKind> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT symbol, timeframe, timestamp, label_entry_price, label_stop_price,
                        label_take_price, label_shares, label_exit_timestamp, label_exit_price,
                        label_exit_reason, label_bars_to_exit, label_pnl, label_outcome
                 FROM bars
                 WHERE symbol = ?1 AND timestamp >= ?2 AND timestamp < ?3
                   AND label_exit_reason IS NOT NULL
                 ORDER BY timeframe, timestamp",
            )
            .map_err(io_err)?;
        let labels = stmt
            .query_map(
                params![symbol, range_start.timestamp(), range_end.timestamp()],
                row_to_label,
            )
            .map_err(io_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err)?;
        Ok(labels)
    }

    // =========================================================================
    // INDICATOR VALUES
    // =========================================================================

    /// Upsert computed indicator rows for a series of bars.
    pub fn write_indicators(
        &self,
        rows: &[(Bar, Vec<IndicatorValue>)],
    ) -> Result<usize, ErrorKind> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(io_err)?;
        let mut written = 0usize;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO indicator_values
                        (symbol, timeframe, timestamp, family, fingerprint, value, valid)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(symbol, timeframe, timestamp, family, fingerprint)
                     DO UPDATE SET value = excluded.value, valid = excluded.valid",
                )
                .map_err(io_err)?;
            for (bar, values) in rows {
                for value in values {
                    stmt.execute(params![
                        bar.symbol,
                        bar.timeframe.as_str(),
                        bar.timestamp.timestamp(),
                        value.family,
                        value.fingerprint,
                        value.value,
                        value.valid as i64,
                    ])
                    .map_err(io_err)?;
                    written += 1;
                }
            }
        }
        tx.commit().map_err(io_err)?;
        Ok(written)
    }

    /// One fingerprint's series over a range.
    pub fn query_indicator(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        fingerprint: &str,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, Option<f64>, bool)>, ErrorKind> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT timestamp, value, valid FROM indicator_values
                 WHERE symbol = ?1 AND timeframe = ?2 AND fingerprint = ?3
                   AND timestamp >= ?4 AND timestamp < ?5
                 ORDER BY timestamp",
            )
            .map_err(io_err)?;
        let rows = stmt
            .query_map(
                params![
                    symbol,
                    timeframe.as_str(),
                    fingerprint,
                    range_start.timestamp(),
                    range_end.timestamp()
                ],
                |r| {
                    Ok((
                        Utc.timestamp_opt(r.get::<_, i64>(0)?, 0).unwrap(),
                        r.get::<_, Option<f64>>(1)?,
                        r.get::<_, i64>(2)? != 0,
                    ))
                },
            )
            .map_err(io_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err)?;
        Ok(rows)
    }

    /// Drop values whose parameter sets left the catalog.
    pub fn prune_indicator_fingerprints(&self, keep: &[String]) -> Result<usize, ErrorKind> {
        let conn = self.conn.lock();
        let placeholders =
            std::iter::repeat("?").take(keep.len()).collect::<Vec<_>>().join(",");
        let sql = if keep.is_empty() {
            "DELETE FROM indicator_values".to_string()
        } else {
            format!("DELETE FROM indicator_values WHERE fingerprint NOT IN ({placeholders})")
        };
        let deleted = conn
            .execute(&sql, rusqlite::params_from_iter(keep.iter()))
            .map_err(io_err)?;
        if deleted > 0 {
            info!(deleted, "pruned indicator values for retired parameter sets");
        }
        Ok(deleted)
    }
}

fn io_err(e: rusqlite::Error) -> ErrorKind {
    ErrorKind::StoreIoError(e.to_string())
}

fn row_to_bar(row: &rusqlite::Row) -> rusqlite::Result<BarRow> {
    let timeframe_str: String = row.get(1)?;
    let session_str: String = row.get(11)?;
    Ok(BarRow {
        bar: Bar {
            symbol: row.get(0)?,
            timeframe: Timeframe::parse(&timeframe_str).unwrap_or(Timeframe::Min1),
            timestamp: Utc.timestamp_opt(row.get::<_, i64>(2)?, 0).unwrap(),
            open: row.get(3)?,
            high: row.get(4)?,
            low: row.get(5)?,
            close: row.get(6)?,
            volume: row.get(7)?,
            source: row.get(8)?,
            ingested_at: Utc.timestamp_opt(row.get::<_, i64>(9)?, 0).unwrap(),
        },
        quality_score: row.get(10)?,
        session: TradingSession::parse(&session_str).unwrap_or(TradingSession::Closed),
    })
}

fn row_to_label(row: &rusqlite::Row) -> rusqlite::Result<SimulationLabel> {
    let timeframe_str: String = row.get(1)?;
    let reason_str: String = row.get(9)?;
    let outcome_str: Option<String> = row.get(12)?;
    Ok(SimulationLabel {
        symbol: row.get(0)?,
        timeframe: Timeframe::parse(&timeframe_str).unwrap_or(Timeframe::Min1),
        entry_timestamp: Utc.timestamp_opt(row.get::<_, i64>(2)?, 0).unwrap(),
        entry_price: row.get(3)?,
        stop_price: row.get(4)?,
        take_price: row.get(5)?,
        shares: row.get(6)?,
        exit_timestamp: row
            .get::<_, Option<i64>>(7)?
            .map(|t| Utc.timestamp_opt(t, 0).unwrap()),
        exit_price: row.get(8)?,
        exit_reason: ExitReason::parse(&reason_str).unwrap_or(ExitReason::OpenAtSessionEnd),
        bars_to_exit: row.get(10)?,
        pnl: row.get(11)?,
        outcome: outcome_str.as_deref().and_then(TradeOutcome::parse),
    })
}
