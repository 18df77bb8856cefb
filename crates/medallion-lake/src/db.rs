//! Connection setup and timestamp codecs shared by the `SQLite` stores.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{LakeError, Result};

const DATE_FMT: &str = "%Y-%m-%d";

/// Open (creating parent directories) and apply idempotent DDL.
pub(crate) fn open(path: &Path, ddl: &str) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| LakeError::io(parent, e))?;
    }
    let conn = Connection::open(path).map_err(|e| LakeError::sqlite("open", e))?;
    conn.busy_timeout(Duration::from_secs(5))
        .map_err(|e| LakeError::sqlite("busy_timeout", e))?;
    init(conn, ddl)
}

pub(crate) fn in_memory(ddl: &str) -> Result<Connection> {
    let conn = Connection::open_in_memory().map_err(|e| LakeError::sqlite("open", e))?;
    init(conn, ddl)
}

fn init(conn: Connection, ddl: &str) -> Result<Connection> {
    conn.execute_batch(ddl)
        .map_err(|e| LakeError::sqlite("create tables", e))?;
    Ok(conn)
}

/// Lossless, lexically ordered UTC timestamp text.
pub(crate) fn ts_to_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn ts_from_text(raw: &str, location: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LakeError::corrupt(location, format!("bad timestamp {raw:?}: {e}")))
}

pub(crate) fn date_to_text(date: NaiveDate) -> String {
    date.format(DATE_FMT).to_string()
}

pub(crate) fn date_from_text(raw: &str, location: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FMT)
        .map_err(|e| LakeError::corrupt(location, format!("bad date {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_text_preserves_subseconds() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let text = ts_to_text(ts);
        assert!(text.ends_with('Z'));
        assert_eq!(ts_from_text(&text, "t").unwrap(), ts);
    }

    #[test]
    fn bad_date_is_corrupt() {
        let err = date_from_text("2026-13-01", "gold").unwrap_err();
        assert!(matches!(err, LakeError::Corrupt { .. }));
    }
}
