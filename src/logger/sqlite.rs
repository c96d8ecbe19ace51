//! SQLite sink: WAL-mode store for activity rows and the history of every
//! verdict recorded in a status map.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, params};

use crate::core::errors::{GateError, Result};

pub struct SqliteLogger {
    conn: Connection,
    path: PathBuf,
}

impl SqliteLogger {
    /// Open (or create) the database at `path`, applying PRAGMAs and schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| GateError::io(parent, source))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ──────────────────── activity_log ────────────────────

    pub fn log_activity(&self, row: &ActivityRow) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO activity_log (
                timestamp, event_type, severity, version_set, scenario, test_run,
                attempts, success, error_code, error_message, details
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            )?
            .execute(params![
                row.timestamp,
                row.event_type,
                row.severity,
                row.version_set,
                row.scenario,
                row.test_run,
                row.attempts,
                row.success,
                row.error_code,
                row.error_message,
                row.details,
            ])?;
        Ok(())
    }

    /// Most recent activity, newest first.
    pub fn recent_activity(&self, limit: u32) -> Result<Vec<ActivityRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT timestamp, event_type, severity, version_set, scenario, test_run,
                    attempts, success, error_code, error_message, details
             FROM activity_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(ActivityRow {
                    timestamp: row.get(0)?,
                    event_type: row.get(1)?,
                    severity: row.get(2)?,
                    version_set: row.get(3)?,
                    scenario: row.get(4)?,
                    test_run: row.get(5)?,
                    attempts: row.get(6)?,
                    success: row.get(7)?,
                    error_code: row.get(8)?,
                    error_message: row.get(9)?,
                    details: row.get(10)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_events_since(&self, event_type: &str, since: &str) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM activity_log WHERE event_type = ?1 AND timestamp >= ?2",
            params![event_type, since],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Delete activity rows older than `retention_days`. Returns rows deleted.
    pub fn prune_activity_log(&self, retention_days: u32) -> Result<usize> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let cutoff = cutoff.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let deleted = self.conn.execute(
            "DELETE FROM activity_log WHERE timestamp < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    // ──────────────────── verdict_history ────────────────────

    pub fn log_verdict(&self, row: &VerdictRow) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO verdict_history (
                timestamp, version_set, scenario, status, detail, test_run, generation
            ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
            )?
            .execute(params![
                row.timestamp,
                row.version_set,
                row.scenario,
                row.status,
                row.detail,
                row.test_run,
                row.generation,
            ])?;
        Ok(())
    }

    /// Every verdict recorded for one version set, oldest first.
    pub fn verdicts_for(&self, version_set: &str) -> Result<Vec<VerdictRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT timestamp, version_set, scenario, status, detail, test_run, generation
             FROM verdict_history WHERE version_set = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![version_set], |row| {
                Ok(VerdictRow {
                    timestamp: row.get(0)?,
                    version_set: row.get(1)?,
                    scenario: row.get(2)?,
                    status: row.get(3)?,
                    detail: row.get(4)?,
                    test_run: row.get(5)?,
                    generation: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn is_wal_mode(&self) -> bool {
        self.conn
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .map(|mode| mode.eq_ignore_ascii_case("wal"))
            .unwrap_or(false)
    }
}

// ──────────────────── row types ────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRow {
    pub timestamp: String,
    pub event_type: String,
    pub severity: String,
    pub version_set: Option<String>,
    pub scenario: Option<String>,
    pub test_run: Option<String>,
    pub attempts: Option<i64>,
    pub success: i32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub details: Option<String>,
}

/// One recorded status for a (version set, scenario).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerdictRow {
    pub timestamp: String,
    pub version_set: String,
    pub scenario: String,
    pub status: String,
    pub detail: String,
    pub test_run: Option<String>,
    pub generation: Option<i64>,
}

// ──────────────────── schema & pragmas ────────────────────

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        eprintln!("[IG-SQLITE] WARNING: requested WAL mode but got '{mode}'");
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS activity_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            version_set TEXT,
            scenario TEXT,
            test_run TEXT,
            attempts INTEGER,
            success INTEGER NOT NULL DEFAULT 1,
            error_code TEXT,
            error_message TEXT,
            details TEXT
        );

        CREATE TABLE IF NOT EXISTS verdict_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            version_set TEXT NOT NULL,
            scenario TEXT NOT NULL,
            status TEXT NOT NULL,
            detail TEXT NOT NULL,
            test_run TEXT,
            generation INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_activity_type_time ON activity_log(event_type, timestamp);
        CREATE INDEX IF NOT EXISTS idx_activity_version_set ON activity_log(version_set);
        CREATE INDEX IF NOT EXISTS idx_verdict_version_set
            ON verdict_history(version_set, scenario);",
    )?;
    Ok(())
}
