//! Canonical silver dataset.
//!
//! One row per `(entity_type, primary_key)`. Merges are version-guarded:
//! a row is only replaced by a strictly greater [`EventVersion`], so
//! replaying or reordering input never moves a row backwards. Removes
//! leave a tombstone that stays out of canonical reads.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDate, Utc};
use medallion_types::event::{EntityType, EventVersion, Operation, SequenceMarker};
use medallion_types::silver::{SilverRow, SilverUpsert};
use rusqlite::{Connection, OptionalExtension, Transaction};

use crate::db;
use crate::error::{LakeError, Result};

const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS silver_rows (
    entity_type TEXT NOT NULL,
    primary_key TEXT NOT NULL,
    attributes_json TEXT NOT NULL,
    last_event_timestamp TEXT NOT NULL,
    last_sequence TEXT,
    last_event_id TEXT NOT NULL,
    last_operation TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, primary_key)
);

CREATE INDEX IF NOT EXISTS idx_silver_live ON silver_rows (entity_type, deleted);
";

const SELECT_COLUMNS: &str = "entity_type, primary_key, attributes_json, last_event_timestamp, \
     last_sequence, last_event_id, last_operation, deleted, processed_at";

/// Outcome counters of one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub inserted: u64,
    pub updated: u64,
    pub tombstoned: u64,
    /// Upserts whose version was not newer than the stored row.
    pub skipped_stale: u64,
}

impl MergeSummary {
    /// Rows whose stored state changed.
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.inserted + self.updated + self.tombstoned
    }
}

/// Row counts of one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityCounts {
    pub live: u64,
    pub tombstoned: u64,
}

/// Storage contract for the canonical dataset.
pub trait SilverStore: Send + Sync {
    /// Apply `upserts` to `entity` in one transaction.
    ///
    /// Inserts absent keys, replaces rows whose stored version is strictly
    /// older, and ignores the rest. Nothing is applied if any upsert fails.
    ///
    /// # Errors
    ///
    /// Returns [`LakeError::EventMutated`] when a stored row carries the
    /// same event id under a different version, or a storage error.
    fn merge(&self, entity: &EntityType, upserts: &[SilverUpsert]) -> Result<MergeSummary>;

    /// Stored row for a key, tombstones included.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    fn get(&self, entity: &EntityType, primary_key: &str) -> Result<Option<SilverRow>>;

    /// Every live row of `entity`, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    fn scan(&self, entity: &EntityType) -> Result<Vec<SilverRow>>;

    /// Live rows whose `date_field` attribute falls in `[from, until)`.
    ///
    /// The attribute's first ten characters are compared as `YYYY-MM-DD`.
    /// Rows lacking the attribute are excluded whenever a bound is given.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    fn scan_date_range(
        &self,
        entity: &EntityType,
        date_field: &str,
        from: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<Vec<SilverRow>>;

    /// # Errors
    ///
    /// Returns a storage error.
    fn counts(&self, entity: &EntityType) -> Result<EntityCounts>;
}

/// `SQLite`-backed [`SilverStore`].
pub struct SqliteSilverStore {
    conn: Mutex<Connection>,
}

impl SqliteSilverStore {
    /// # Errors
    ///
    /// Returns an error if the database can't be opened or initialized.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(db::open(path, CREATE_TABLES)?),
        })
    }

    /// # Errors
    ///
    /// Returns an error if the in-memory database can't be initialized.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(db::in_memory(CREATE_TABLES)?),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| LakeError::LockPoisoned)
    }

    fn query_rows(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<SilverRow>> {
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| LakeError::sqlite("silver query: prepare", e))?;
        let raw_rows = stmt
            .query_map(params, RawRow::from_sql)
            .map_err(|e| LakeError::sqlite("silver query: execute", e))?;

        let mut out = Vec::new();
        for raw in raw_rows {
            let raw = raw.map_err(|e| LakeError::sqlite("silver query: row", e))?;
            out.push(raw.into_row()?);
        }
        Ok(out)
    }
}

impl SilverStore for SqliteSilverStore {
    fn merge(&self, entity: &EntityType, upserts: &[SilverUpsert]) -> Result<MergeSummary> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| LakeError::sqlite("merge: begin tx", e))?;
        let processed_at = db::ts_to_text(Utc::now());
        let mut summary = MergeSummary::default();

        for upsert in upserts {
            if upsert.entity_type != *entity {
                return Err(LakeError::corrupt(
                    format!("silver/{entity}"),
                    format!(
                        "upsert for {}/{} routed to {entity}",
                        upsert.entity_type, upsert.primary_key
                    ),
                ));
            }

            let stored = stored_version(&tx, entity, &upsert.primary_key)?;
            if let Some(stored) = &stored {
                if stored.event_id == upsert.version.event_id && *stored != upsert.version {
                    return Err(LakeError::EventMutated {
                        entity: entity.to_string(),
                        primary_key: upsert.primary_key.clone(),
                        event_id: stored.event_id.clone(),
                    });
                }
                if upsert.version <= *stored {
                    summary.skipped_stale += 1;
                    continue;
                }
            }

            write_row(&tx, upsert, &processed_at)?;
            if upsert.operation.is_remove() {
                summary.tombstoned += 1;
            } else if stored.is_some() {
                summary.updated += 1;
            } else {
                summary.inserted += 1;
            }
        }

        tx.commit()
            .map_err(|e| LakeError::sqlite("merge: commit", e))?;

        tracing::debug!(
            entity = entity.as_str(),
            inserted = summary.inserted,
            updated = summary.updated,
            tombstoned = summary.tombstoned,
            skipped_stale = summary.skipped_stale,
            "Silver merge committed"
        );
        Ok(summary)
    }

    fn get(&self, entity: &EntityType, primary_key: &str) -> Result<Option<SilverRow>> {
        let conn = self.lock_conn()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM silver_rows \
                     WHERE entity_type = ?1 AND primary_key = ?2"
                ),
                rusqlite::params![entity.as_str(), primary_key],
                RawRow::from_sql,
            )
            .optional()
            .map_err(|e| LakeError::sqlite("silver get", e))?;
        raw.map(RawRow::into_row).transpose()
    }

    fn scan(&self, entity: &EntityType) -> Result<Vec<SilverRow>> {
        let conn = self.lock_conn()?;
        Self::query_rows(
            &conn,
            &format!(
                "SELECT {SELECT_COLUMNS} FROM silver_rows \
                 WHERE entity_type = ?1 AND deleted = 0 ORDER BY primary_key"
            ),
            &[&entity.as_str()],
        )
    }

    fn scan_date_range(
        &self,
        entity: &EntityType,
        date_field: &str,
        from: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<Vec<SilverRow>> {
        let conn = self.lock_conn()?;
        let path = format!("$.\"{}\"", date_field.replace('"', "\\\""));
        let from = from.map(db::date_to_text);
        let until = until.map(db::date_to_text);
        Self::query_rows(
            &conn,
            &format!(
                "SELECT {SELECT_COLUMNS} FROM silver_rows \
                 WHERE entity_type = ?1 AND deleted = 0 \
                 AND (?3 IS NULL OR substr(json_extract(attributes_json, ?2), 1, 10) >= ?3) \
                 AND (?4 IS NULL OR substr(json_extract(attributes_json, ?2), 1, 10) < ?4) \
                 ORDER BY primary_key"
            ),
            &[&entity.as_str(), &path, &from, &until],
        )
    }

    #[allow(clippy::cast_sign_loss)]
    fn counts(&self, entity: &EntityType) -> Result<EntityCounts> {
        let conn = self.lock_conn()?;
        let (live, tombstoned): (i64, i64) = conn
            .query_row(
                "SELECT COALESCE(SUM(deleted = 0), 0), COALESCE(SUM(deleted = 1), 0) \
                 FROM silver_rows WHERE entity_type = ?1",
                [entity.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| LakeError::sqlite("silver counts", e))?;
        Ok(EntityCounts {
            live: live as u64,
            tombstoned: tombstoned as u64,
        })
    }
}

fn stored_version(
    tx: &Transaction<'_>,
    entity: &EntityType,
    primary_key: &str,
) -> Result<Option<EventVersion>> {
    let raw = tx
        .query_row(
            "SELECT last_event_timestamp, last_sequence, last_event_id FROM silver_rows \
             WHERE entity_type = ?1 AND primary_key = ?2",
            rusqlite::params![entity.as_str(), primary_key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()
        .map_err(|e| LakeError::sqlite("merge: read stored version", e))?;

    raw.map(|(ts, sequence, event_id)| {
        Ok(EventVersion {
            timestamp: db::ts_from_text(&ts, &format!("silver/{entity}/{primary_key}"))?,
            sequence: sequence.map(SequenceMarker::new),
            event_id,
        })
    })
    .transpose()
}

fn write_row(tx: &Transaction<'_>, upsert: &SilverUpsert, processed_at: &str) -> Result<()> {
    let attributes = serde_json::to_string(&upsert.attributes).map_err(|e| {
        LakeError::json(
            format!("silver/{}/{}", upsert.entity_type, upsert.primary_key),
            e,
        )
    })?;
    tx.execute(
        "INSERT INTO silver_rows \
         (entity_type, primary_key, attributes_json, last_event_timestamp, last_sequence, \
          last_event_id, last_operation, deleted, processed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
         ON CONFLICT(entity_type, primary_key) DO UPDATE SET \
         attributes_json = excluded.attributes_json, \
         last_event_timestamp = excluded.last_event_timestamp, \
         last_sequence = excluded.last_sequence, \
         last_event_id = excluded.last_event_id, \
         last_operation = excluded.last_operation, \
         deleted = excluded.deleted, \
         processed_at = excluded.processed_at",
        rusqlite::params![
            upsert.entity_type.as_str(),
            upsert.primary_key,
            attributes,
            db::ts_to_text(upsert.version.timestamp),
            upsert.version.sequence.as_ref().map(SequenceMarker::as_str),
            upsert.version.event_id,
            upsert.operation.as_str(),
            upsert.operation.is_remove(),
            processed_at,
        ],
    )
    .map_err(|e| LakeError::sqlite("merge: write row", e))?;
    Ok(())
}

/// Column values as stored, before validation.
struct RawRow {
    entity_type: String,
    primary_key: String,
    attributes_json: String,
    last_event_timestamp: String,
    last_sequence: Option<String>,
    last_event_id: String,
    last_operation: String,
    deleted: bool,
    processed_at: String,
}

impl RawRow {
    fn from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_type: row.get(0)?,
            primary_key: row.get(1)?,
            attributes_json: row.get(2)?,
            last_event_timestamp: row.get(3)?,
            last_sequence: row.get(4)?,
            last_event_id: row.get(5)?,
            last_operation: row.get(6)?,
            deleted: row.get(7)?,
            processed_at: row.get(8)?,
        })
    }

    fn into_row(self) -> Result<SilverRow> {
        let location = format!("silver/{}/{}", self.entity_type, self.primary_key);
        let attributes = serde_json::from_str(&self.attributes_json)
            .map_err(|e| LakeError::json(location.clone(), e))?;
        let last_operation = Operation::parse(&self.last_operation).ok_or_else(|| {
            LakeError::corrupt(&location, format!("unknown operation {:?}", self.last_operation))
        })?;
        Ok(SilverRow {
            entity_type: EntityType::new(self.entity_type),
            last_event_timestamp: db::ts_from_text(&self.last_event_timestamp, &location)?,
            processed_at: db::ts_from_text(&self.processed_at, &location)?,
            primary_key: self.primary_key,
            attributes,
            last_sequence_marker: self.last_sequence.map(SequenceMarker::new),
            last_event_id: self.last_event_id,
            last_operation,
            deleted: self.deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use serde_json::json;

    fn orders() -> EntityType {
        EntityType::new("orders")
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn upsert(key: &str, op: Operation, secs: i64, id: &str, amount: f64) -> SilverUpsert {
        let mut attributes = serde_json::Map::new();
        if !op.is_remove() {
            attributes.insert("TotalAmount".into(), json!(amount));
            attributes.insert("OrderDate".into(), json!("2026-02-10 09:30:00"));
        }
        SilverUpsert {
            entity_type: orders(),
            primary_key: key.into(),
            operation: op,
            version: EventVersion {
                timestamp: ts(secs),
                sequence: None,
                event_id: id.into(),
            },
            attributes,
        }
    }

    #[test]
    fn merge_inserts_then_updates_newer() {
        let store = SqliteSilverStore::in_memory().unwrap();
        let first = store
            .merge(&orders(), &[upsert("O1", Operation::Insert, 10, "a", 100.0)])
            .unwrap();
        assert_eq!(first.inserted, 1);

        let second = store
            .merge(&orders(), &[upsert("O1", Operation::Modify, 20, "b", 120.0)])
            .unwrap();
        assert_eq!(second.updated, 1);

        let row = store.get(&orders(), "O1").unwrap().unwrap();
        assert_eq!(row.number("TotalAmount"), Some(120.0));
        assert_eq!(row.last_event_id, "b");
        assert_eq!(row.last_operation, Operation::Modify);
    }

    #[test]
    fn older_version_is_ignored() {
        let store = SqliteSilverStore::in_memory().unwrap();
        store
            .merge(&orders(), &[upsert("O1", Operation::Insert, 100, "a", 100.0)])
            .unwrap();
        let summary = store
            .merge(&orders(), &[upsert("O1", Operation::Modify, 90, "b", 90.0)])
            .unwrap();
        assert_eq!(summary.skipped_stale, 1);
        assert_eq!(summary.applied(), 0);

        let row = store.get(&orders(), "O1").unwrap().unwrap();
        assert_eq!(row.number("TotalAmount"), Some(100.0));
        assert_eq!(row.last_operation, Operation::Insert);
    }

    #[test]
    fn replaying_same_event_is_a_noop() {
        let store = SqliteSilverStore::in_memory().unwrap();
        let u = upsert("O1", Operation::Insert, 10, "a", 100.0);
        store.merge(&orders(), std::slice::from_ref(&u)).unwrap();
        let before = store.get(&orders(), "O1").unwrap().unwrap();

        let again = store.merge(&orders(), &[u]).unwrap();
        assert_eq!(again.skipped_stale, 1);
        let after = store.get(&orders(), "O1").unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn mutated_event_id_is_rejected_and_rolled_back() {
        let store = SqliteSilverStore::in_memory().unwrap();
        store
            .merge(&orders(), &[upsert("O1", Operation::Insert, 10, "a", 100.0)])
            .unwrap();

        let err = store
            .merge(
                &orders(),
                &[
                    upsert("O2", Operation::Insert, 10, "x", 5.0),
                    upsert("O1", Operation::Modify, 50, "a", 1.0),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, LakeError::EventMutated { .. }));
        assert!(store.get(&orders(), "O2").unwrap().is_none());
    }

    #[test]
    fn zero_padded_sequence_redelivery_is_skipped() {
        let store = SqliteSilverStore::in_memory().unwrap();
        let mut padded = upsert("O1", Operation::Insert, 10, "a", 100.0);
        padded.version.sequence = Some(SequenceMarker::new("0042"));
        store.merge(&orders(), &[padded]).unwrap();

        let mut plain = upsert("O1", Operation::Insert, 10, "a", 100.0);
        plain.version.sequence = Some(SequenceMarker::new("42"));
        let summary = store.merge(&orders(), &[plain]).unwrap();
        assert_eq!(summary.skipped_stale, 1);
        assert_eq!(summary.applied(), 0);
    }

    #[test]
    fn remove_tombstones_and_blocks_resurrection() {
        let store = SqliteSilverStore::in_memory().unwrap();
        store
            .merge(&orders(), &[upsert("O1", Operation::Insert, 10, "a", 100.0)])
            .unwrap();
        let removed = store
            .merge(&orders(), &[upsert("O1", Operation::Remove, 20, "b", 0.0)])
            .unwrap();
        assert_eq!(removed.tombstoned, 1);

        assert!(store.scan(&orders()).unwrap().is_empty());
        let tomb = store.get(&orders(), "O1").unwrap().unwrap();
        assert!(tomb.deleted);

        let late = store
            .merge(&orders(), &[upsert("O1", Operation::Modify, 15, "c", 7.0)])
            .unwrap();
        assert_eq!(late.skipped_stale, 1);
        assert!(store.scan(&orders()).unwrap().is_empty());

        let counts = store.counts(&orders()).unwrap();
        assert_eq!(counts, EntityCounts { live: 0, tombstoned: 1 });
    }

    #[test]
    fn newer_insert_revives_tombstone() {
        let store = SqliteSilverStore::in_memory().unwrap();
        store
            .merge(&orders(), &[upsert("O1", Operation::Remove, 20, "b", 0.0)])
            .unwrap();
        store
            .merge(&orders(), &[upsert("O1", Operation::Insert, 30, "c", 9.0)])
            .unwrap();
        let row = store.get(&orders(), "O1").unwrap().unwrap();
        assert!(!row.deleted);
        assert_eq!(store.scan(&orders()).unwrap().len(), 1);
    }

    #[test]
    fn sequence_marker_breaks_timestamp_ties() {
        let store = SqliteSilverStore::in_memory().unwrap();
        let mut low = upsert("O1", Operation::Modify, 10, "z", 1.0);
        low.version.sequence = Some(SequenceMarker::new("9"));
        let mut high = upsert("O1", Operation::Modify, 10, "y", 2.0);
        high.version.sequence = Some(SequenceMarker::new("10"));

        store.merge(&orders(), &[high]).unwrap();
        store.merge(&orders(), &[low]).unwrap();

        let row = store.get(&orders(), "O1").unwrap().unwrap();
        assert_eq!(row.number("TotalAmount"), Some(2.0));
        assert_eq!(row.last_sequence_marker, Some(SequenceMarker::new("10")));
    }

    #[test]
    fn wrong_entity_is_rejected() {
        let store = SqliteSilverStore::in_memory().unwrap();
        let err = store
            .merge(
                &EntityType::new("products"),
                &[upsert("O1", Operation::Insert, 10, "a", 1.0)],
            )
            .unwrap_err();
        assert!(matches!(err, LakeError::Corrupt { .. }));
    }

    #[test]
    fn date_range_scan_filters_on_attribute_prefix() {
        let store = SqliteSilverStore::in_memory().unwrap();
        let mut rows = Vec::new();
        for (key, date) in [
            ("O1", "2026-01-31 23:59:59"),
            ("O2", "2026-02-01 00:00:00"),
            ("O3", "2026-02-15T08:00:00Z"),
            ("O4", "2026-03-01 00:00:00"),
        ] {
            let mut u = upsert(key, Operation::Insert, 10, key, 1.0);
            u.attributes.insert("OrderDate".into(), json!(date));
            rows.push(u);
        }
        store.merge(&orders(), &rows).unwrap();

        let feb = store
            .scan_date_range(
                &orders(),
                "OrderDate",
                NaiveDate::from_ymd_opt(2026, 2, 1),
                NaiveDate::from_ymd_opt(2026, 3, 1),
            )
            .unwrap();
        let keys: Vec<_> = feb.iter().map(|r| r.primary_key.as_str()).collect();
        assert_eq!(keys, vec!["O2", "O3"]);

        let open = store.scan_date_range(&orders(), "OrderDate", None, None).unwrap();
        assert_eq!(open.len(), 4);
    }

    #[test]
    fn open_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silver/silver.db");
        {
            let store = SqliteSilverStore::open(&path).unwrap();
            store
                .merge(&orders(), &[upsert("O1", Operation::Insert, 10, "a", 1.0)])
                .unwrap();
        }
        let store = SqliteSilverStore::open(&path).unwrap();
        assert!(store.get(&orders(), "O1").unwrap().is_some());
    }
}
