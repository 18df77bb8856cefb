//! `SQLite`-backed implementation of [`StateBackend`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use medallion_types::envelope::{DlqRecord, Timestamp};
use medallion_types::error::ErrorCategory;
use medallion_types::state::{PipelineId, RunStats, RunStatus, Stage, StateKey, WatermarkState};
use rusqlite::{Connection, OptionalExtension};

use crate::backend::StateBackend;
use crate::error::{self, StateError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS watermarks (
    pipeline TEXT NOT NULL,
    state_key TEXT NOT NULL,
    watermark_value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (pipeline, state_key)
);

CREATE TABLE IF NOT EXISTS leases (
    pipeline TEXT NOT NULL,
    state_key TEXT NOT NULL,
    holder TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    PRIMARY KEY (pipeline, state_key)
);

CREATE TABLE IF NOT EXISTS stage_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    stage TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    records_read INTEGER DEFAULT 0,
    records_written INTEGER DEFAULT 0,
    records_quarantined INTEGER DEFAULT 0,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS dlq_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    run_id INTEGER NOT NULL REFERENCES stage_runs(id),
    stream_name TEXT NOT NULL,
    record_json TEXT NOT NULL,
    error_message TEXT NOT NULL,
    error_category TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_dlq_pipeline_run ON dlq_records (pipeline, run_id);
";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

impl SqliteStateBackend {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Backend`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(StateError::backend)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(StateError::backend)?;
        Self::init(conn)
    }

    /// Create an in-memory `SQLite` backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(StateError::backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }

    fn parse_category(raw: &str) -> ErrorCategory {
        serde_json::from_value(serde_json::Value::String(raw.to_string()))
            .unwrap_or(ErrorCategory::Internal)
    }

    #[cfg(test)]
    fn get_run_row(
        &self,
        run_id: i64,
    ) -> error::Result<(String, String, i64, Option<String>, Option<String>)> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT stage, status, records_read, finished_at, error_message \
             FROM stage_runs WHERE id = ?1",
            [run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .map_err(StateError::backend)
    }
}

impl StateBackend for SqliteStateBackend {
    fn get_watermark(
        &self,
        pipeline: &PipelineId,
        key: &StateKey,
    ) -> error::Result<Option<WatermarkState>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT watermark_value, updated_at \
                 FROM watermarks WHERE pipeline = ?1 AND state_key = ?2",
                rusqlite::params![pipeline.as_str(), key.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|e| StateError::backend_context("get_watermark", e))?;

        Ok(row.map(|(value, updated_at)| WatermarkState {
            value,
            updated_at: Self::sqlite_to_iso8601(&updated_at),
        }))
    }

    fn set_watermark(
        &self,
        pipeline: &PipelineId,
        key: &StateKey,
        value: &str,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO watermarks (pipeline, state_key, watermark_value, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(pipeline, state_key) \
             DO UPDATE SET watermark_value = ?3, updated_at = ?4",
            rusqlite::params![pipeline.as_str(), key.as_str(), value, Self::now_sqlite()],
        )
        .map_err(|e| StateError::backend_context("set_watermark", e))?;
        Ok(())
    }

    fn compare_and_set(
        &self,
        pipeline: &PipelineId,
        key: &StateKey,
        expected: Option<&str>,
        new_value: &str,
    ) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let now = Self::now_sqlite();

        let rows_affected = match expected {
            Some(expected_val) => conn
                .execute(
                    "UPDATE watermarks SET watermark_value = ?1, updated_at = ?2 \
                     WHERE pipeline = ?3 AND state_key = ?4 AND watermark_value = ?5",
                    rusqlite::params![new_value, now, pipeline.as_str(), key.as_str(), expected_val],
                )
                .map_err(|e| StateError::backend_context("compare_and_set", e))?,
            None => conn
                .execute(
                    "INSERT OR IGNORE INTO watermarks (pipeline, state_key, watermark_value, updated_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![pipeline.as_str(), key.as_str(), new_value, now],
                )
                .map_err(|e| StateError::backend_context("compare_and_set", e))?,
        };

        Ok(rows_affected > 0)
    }

    fn list_watermarks(
        &self,
        pipeline: &PipelineId,
    ) -> error::Result<Vec<(StateKey, WatermarkState)>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT state_key, watermark_value, updated_at FROM watermarks \
                 WHERE pipeline = ?1 ORDER BY state_key",
            )
            .map_err(|e| StateError::backend_context("list_watermarks: prepare", e))?;
        let rows = stmt
            .query_map([pipeline.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| StateError::backend_context("list_watermarks: query", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (key, value, updated_at) =
                row.map_err(|e| StateError::backend_context("list_watermarks: row", e))?;
            out.push((
                StateKey::new(key),
                WatermarkState {
                    value,
                    updated_at: Self::sqlite_to_iso8601(&updated_at),
                },
            ));
        }
        Ok(out)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn try_acquire_lease(
        &self,
        pipeline: &PipelineId,
        key: &StateKey,
        holder: &str,
        ttl: Duration,
    ) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let expires_at_ms = now_ms.saturating_add(ttl.as_millis() as i64);

        // The upsert only overwrites an existing row once it has expired.
        let rows_affected = conn
            .execute(
                "INSERT INTO leases (pipeline, state_key, holder, acquired_at, expires_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(pipeline, state_key) DO UPDATE SET \
                 holder = excluded.holder, acquired_at = excluded.acquired_at, \
                 expires_at_ms = excluded.expires_at_ms \
                 WHERE leases.expires_at_ms <= ?6",
                rusqlite::params![
                    pipeline.as_str(),
                    key.as_str(),
                    holder,
                    now.format(SQLITE_DATETIME_FMT).to_string(),
                    expires_at_ms,
                    now_ms,
                ],
            )
            .map_err(|e| StateError::backend_context("try_acquire_lease", e))?;

        Ok(rows_affected > 0)
    }

    fn release_lease(
        &self,
        pipeline: &PipelineId,
        key: &StateKey,
        holder: &str,
    ) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let rows_affected = conn
            .execute(
                "DELETE FROM leases WHERE pipeline = ?1 AND state_key = ?2 AND holder = ?3",
                rusqlite::params![pipeline.as_str(), key.as_str(), holder],
            )
            .map_err(|e| StateError::backend_context("release_lease", e))?;
        Ok(rows_affected > 0)
    }

    fn start_run(&self, pipeline: &PipelineId, stage: Stage) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO stage_runs (pipeline, stage, status) VALUES (?1, ?2, ?3)",
            rusqlite::params![pipeline.as_str(), stage.as_str(), RunStatus::Running.as_str()],
        )
        .map_err(|e| StateError::backend_context("start_run", e))?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE stage_runs SET status = ?1, finished_at = datetime('now'), \
             records_read = ?2, records_written = ?3, records_quarantined = ?4, \
             error_message = ?5 WHERE id = ?6",
            rusqlite::params![
                status.as_str(),
                stats.records_read as i64,
                stats.records_written as i64,
                stats.records_quarantined as i64,
                stats.error_message,
                run_id,
            ],
        )
        .map_err(|e| StateError::backend_context("complete_run", e))?;
        Ok(())
    }

    fn insert_dlq_records(
        &self,
        pipeline: &PipelineId,
        run_id: i64,
        records: &[DlqRecord],
    ) -> error::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("insert_dlq_records: begin tx", e))?;
        let mut stmt = tx
            .prepare(
                "INSERT INTO dlq_records \
                 (pipeline, run_id, stream_name, record_json, error_message, error_category, failed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .map_err(|e| StateError::backend_context("insert_dlq_records: prepare", e))?;

        let mut count = 0u64;
        for record in records {
            stmt.execute(rusqlite::params![
                pipeline.as_str(),
                run_id,
                record.stream_name,
                record.record_json,
                record.error_message,
                record.error_category.to_string(),
                record.failed_at.as_str(),
            ])
            .map_err(|e| StateError::backend_context("insert_dlq_records: execute", e))?;
            count += 1;
        }
        drop(stmt);
        tx.commit()
            .map_err(|e| StateError::backend_context("insert_dlq_records: commit", e))?;

        Ok(count)
    }

    #[allow(clippy::cast_possible_wrap)]
    fn list_dlq_records(
        &self,
        pipeline: &PipelineId,
        limit: usize,
    ) -> error::Result<Vec<DlqRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT stream_name, record_json, error_message, error_category, failed_at \
                 FROM dlq_records WHERE pipeline = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| StateError::backend_context("list_dlq_records: prepare", e))?;
        let rows = stmt
            .query_map(rusqlite::params![pipeline.as_str(), limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| StateError::backend_context("list_dlq_records: query", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (stream_name, record_json, error_message, category, failed_at) =
                row.map_err(|e| StateError::backend_context("list_dlq_records: row", e))?;
            out.push(DlqRecord {
                stream_name,
                record_json,
                error_message,
                error_category: Self::parse_category(&category),
                failed_at: Timestamp::new(failed_at),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(name: &str) -> PipelineId {
        PipelineId::new(name)
    }

    fn key(name: &str) -> StateKey {
        StateKey::new(name)
    }

    #[test]
    fn watermark_roundtrip() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        assert!(backend
            .get_watermark(&pid("p"), &key("silver.orders"))
            .unwrap()
            .is_none());

        backend
            .set_watermark(&pid("p"), &key("silver.orders"), "20260115T100000000_a")
            .unwrap();

        let wm = backend
            .get_watermark(&pid("p"), &key("silver.orders"))
            .unwrap()
            .unwrap();
        assert_eq!(wm.value, "20260115T100000000_a");
        assert!(wm.updated_at.ends_with('Z'));
    }

    #[test]
    fn watermark_upsert_overwrites() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        backend.set_watermark(&pid("p"), &key("k"), "100").unwrap();
        backend.set_watermark(&pid("p"), &key("k"), "200").unwrap();
        let wm = backend.get_watermark(&pid("p"), &key("k")).unwrap().unwrap();
        assert_eq!(wm.value, "200");
    }

    #[test]
    fn different_pipelines_independent() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        backend.set_watermark(&pid("a"), &key("k"), "aaa").unwrap();
        backend.set_watermark(&pid("b"), &key("k"), "bbb").unwrap();

        let a = backend.get_watermark(&pid("a"), &key("k")).unwrap().unwrap();
        let b = backend.get_watermark(&pid("b"), &key("k")).unwrap().unwrap();
        assert_eq!(a.value, "aaa");
        assert_eq!(b.value, "bbb");
    }

    #[test]
    fn compare_and_set_success() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        backend.set_watermark(&pid("p"), &key("k"), "100").unwrap();

        assert!(backend
            .compare_and_set(&pid("p"), &key("k"), Some("100"), "200")
            .unwrap());
        let got = backend.get_watermark(&pid("p"), &key("k")).unwrap().unwrap();
        assert_eq!(got.value, "200");
    }

    #[test]
    fn compare_and_set_failure_mismatch() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        backend.set_watermark(&pid("p"), &key("k"), "100").unwrap();

        assert!(!backend
            .compare_and_set(&pid("p"), &key("k"), Some("999"), "200")
            .unwrap());
        let got = backend.get_watermark(&pid("p"), &key("k")).unwrap().unwrap();
        assert_eq!(got.value, "100");
    }

    #[test]
    fn compare_and_set_from_none() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        assert!(backend
            .compare_and_set(&pid("p"), &key("k"), None, "50")
            .unwrap());
        assert!(!backend
            .compare_and_set(&pid("p"), &key("k"), None, "60")
            .unwrap());
        let got = backend.get_watermark(&pid("p"), &key("k")).unwrap().unwrap();
        assert_eq!(got.value, "50");
    }

    #[test]
    fn list_watermarks_is_sorted_per_pipeline() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        backend.set_watermark(&pid("p"), &key("silver.products"), "2").unwrap();
        backend.set_watermark(&pid("p"), &key("silver.orders"), "1").unwrap();
        backend.set_watermark(&pid("other"), &key("silver.orders"), "9").unwrap();

        let all = backend.list_watermarks(&pid("p")).unwrap();
        let keys: Vec<&str> = all.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["silver.orders", "silver.products"]);
    }

    #[test]
    fn lease_is_exclusive_until_released() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let ttl = Duration::from_secs(60);
        assert!(backend
            .try_acquire_lease(&pid("p"), &key("silver.orders"), "pass-a", ttl)
            .unwrap());
        assert!(!backend
            .try_acquire_lease(&pid("p"), &key("silver.orders"), "pass-b", ttl)
            .unwrap());

        assert!(!backend
            .release_lease(&pid("p"), &key("silver.orders"), "pass-b")
            .unwrap());
        assert!(backend
            .release_lease(&pid("p"), &key("silver.orders"), "pass-a")
            .unwrap());
        assert!(backend
            .try_acquire_lease(&pid("p"), &key("silver.orders"), "pass-b", ttl)
            .unwrap());
    }

    #[test]
    fn leases_on_different_keys_are_independent() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let ttl = Duration::from_secs(60);
        assert!(backend
            .try_acquire_lease(&pid("p"), &key("silver.orders"), "a", ttl)
            .unwrap());
        assert!(backend
            .try_acquire_lease(&pid("p"), &key("silver.products"), "b", ttl)
            .unwrap());
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        assert!(backend
            .try_acquire_lease(&pid("p"), &key("k"), "crashed", Duration::ZERO)
            .unwrap());
        assert!(backend
            .try_acquire_lease(&pid("p"), &key("k"), "next", Duration::from_secs(60))
            .unwrap());
    }

    #[test]
    fn run_lifecycle() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.start_run(&pid("p"), Stage::Silver).unwrap();
        assert!(run_id > 0);

        backend
            .complete_run(
                run_id,
                RunStatus::Completed,
                &RunStats {
                    records_read: 1000,
                    records_written: 990,
                    records_quarantined: 0,
                    error_message: None,
                },
            )
            .unwrap();

        let (stage, status, records_read, finished, _error) = backend.get_run_row(run_id).unwrap();
        assert_eq!(stage, "silver");
        assert_eq!(status, "completed");
        assert_eq!(records_read, 1000);
        assert!(finished.is_some());
    }

    #[test]
    fn run_failure() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.start_run(&pid("p"), Stage::Bronze).unwrap();

        backend
            .complete_run(
                run_id,
                RunStatus::Failed,
                &RunStats {
                    records_read: 50,
                    error_message: Some("disk full".into()),
                    ..RunStats::default()
                },
            )
            .unwrap();

        let (_stage, status, _records, _finished, error_msg) = backend.get_run_row(run_id).unwrap();
        assert_eq!(status, "failed");
        assert_eq!(error_msg, Some("disk full".into()));
    }

    #[test]
    fn dlq_records_insert_and_list() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.start_run(&pid("p"), Stage::Bronze).unwrap();

        let records = vec![
            DlqRecord {
                stream_name: "orders".into(),
                record_json: r#"{"eventName":"INSERT"}"#.into(),
                error_message: "missing Keys".into(),
                error_category: ErrorCategory::MalformedEvent,
                failed_at: Timestamp::new("2026-02-21T12:00:00+00:00"),
            },
            DlqRecord {
                stream_name: "orders".into(),
                record_json: "not json".into(),
                error_message: "invalid json".into(),
                error_category: ErrorCategory::MalformedEvent,
                failed_at: Timestamp::new("2026-02-21T12:00:01+00:00"),
            },
        ];

        let count = backend.insert_dlq_records(&pid("p"), run_id, &records).unwrap();
        assert_eq!(count, 2);

        let listed = backend.list_dlq_records(&pid("p"), 10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].error_message, "invalid json");
        assert_eq!(listed[1].error_category, ErrorCategory::MalformedEvent);
    }

    #[test]
    fn dlq_records_empty_insert() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let count = backend.insert_dlq_records(&pid("p"), 1, &[]).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn sqlite_to_iso8601_conversion() {
        let iso = SqliteStateBackend::sqlite_to_iso8601("2024-01-15 10:00:00");
        assert_eq!(iso, "2024-01-15T10:00:00Z");
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.db");
        let backend = SqliteStateBackend::open(&path).unwrap();
        backend.set_watermark(&pid("p"), &key("k"), "1").unwrap();
        assert!(path.exists());
    }
}
