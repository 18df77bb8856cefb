//! Bronze-layer record and partition addressing.
//!
//! Bronze objects are immutable batches of raw change events, stored
//! under `year=YYYY/month=MM/day=DD` of their ingestion time. Each object
//! is named by its [`BronzePosition`], which is also the unit the silver
//! watermark advances over.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::event::ChangeEvent;

const POSITION_TS_FMT: &str = "%Y%m%dT%H%M%S";
/// Length of the `YYYYMMDDTHHMMSS` prefix.
const POSITION_SECS_LEN: usize = 15;
/// Seconds prefix plus three millisecond digits.
const POSITION_TS_LEN: usize = POSITION_SECS_LEN + 3;

/// Date partition of a bronze object (`year=/month=/day=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionCoords {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl PartitionCoords {
    #[must_use]
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
            day: date.day(),
        }
    }

    #[must_use]
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self::from_date(ts.date_naive())
    }

    /// Calendar date of the partition, `None` for impossible coordinates.
    #[must_use]
    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }

    /// Relative path of the partition directory.
    #[must_use]
    pub fn path_segment(&self) -> String {
        format!(
            "year={:04}/month={:02}/day={:02}",
            self.year, self.month, self.day
        )
    }

    /// Parse the three `key=value` directory names of a partition path.
    #[must_use]
    pub fn parse_segments(year: &str, month: &str, day: &str) -> Option<Self> {
        let year = year.strip_prefix("year=")?.parse().ok()?;
        let month = month.strip_prefix("month=")?.parse().ok()?;
        let day = day.strip_prefix("day=")?.parse().ok()?;
        let coords = Self { year, month, day };
        coords.date().map(|_| coords)
    }
}

impl fmt::Display for PartitionCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path_segment())
    }
}

/// Position of a bronze object in ingestion order.
///
/// Ordered by ingestion time (millisecond precision), then batch id. The
/// string form `YYYYMMDDTHHMMSSmmm_<batch>` sorts the same way.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BronzePosition {
    pub ingested_at: DateTime<Utc>,
    pub batch_id: String,
}

impl BronzePosition {
    #[must_use]
    pub fn new(ingested_at: DateTime<Utc>, batch_id: impl Into<String>) -> Self {
        Self {
            ingested_at: ingested_at.trunc_subsecs(3),
            batch_id: batch_id.into(),
        }
    }

    #[must_use]
    pub fn partition(&self) -> PartitionCoords {
        PartitionCoords::from_timestamp(self.ingested_at)
    }

    /// Stable string key, also used as the object file stem.
    #[must_use]
    pub fn to_key(&self) -> String {
        format!(
            "{}{:03}_{}",
            self.ingested_at.format(POSITION_TS_FMT),
            self.ingested_at.timestamp_subsec_millis(),
            self.batch_id
        )
    }

    /// Parse a key produced by [`BronzePosition::to_key`].
    #[must_use]
    pub fn parse_key(key: &str) -> Option<Self> {
        let (ts, batch_id) = key.split_once('_')?;
        if ts.len() != POSITION_TS_LEN || batch_id.is_empty() {
            return None;
        }
        let secs =
            NaiveDateTime::parse_from_str(ts.get(..POSITION_SECS_LEN)?, POSITION_TS_FMT).ok()?;
        let millis: i64 = ts.get(POSITION_SECS_LEN..)?.parse().ok()?;
        let ingested_at = (secs + Duration::milliseconds(millis)).and_utc();
        Some(Self {
            ingested_at,
            batch_id: batch_id.to_string(),
        })
    }
}

impl fmt::Display for BronzePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key())
    }
}

/// One change event as persisted in the bronze layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BronzeRecord {
    pub event: ChangeEvent,
    pub ingestion_timestamp: DateTime<Utc>,
    pub batch_id: String,
}

impl BronzeRecord {
    #[must_use]
    pub fn partition(&self) -> PartitionCoords {
        PartitionCoords::from_timestamp(self.ingestion_timestamp)
    }
}
