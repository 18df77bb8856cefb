//! Immutable bronze object log.
//!
//! Every ingested batch becomes one JSON Lines object per entity, stored at
//! `<root>/bronze/<entity>/year=YYYY/month=MM/day=DD/<position>.jsonl`.
//! Objects are never rewritten; listing walks the partition tree and
//! prunes directories outside the requested date range.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use medallion_types::bronze::{BronzePosition, BronzeRecord, PartitionCoords};
use medallion_types::event::EntityType;

use crate::error::{LakeError, Result};

const OBJECT_EXT: &str = "jsonl";

/// Handle to one durable bronze object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BronzeObjectRef {
    pub entity: EntityType,
    pub position: BronzePosition,
    pub path: PathBuf,
}

/// Append-only store of bronze objects.
pub trait BronzeLog: Send + Sync {
    /// Durably write `records` as a new object at `position`.
    ///
    /// The object becomes visible to [`list_after`](Self::list_after)
    /// atomically, only once fully written.
    ///
    /// # Errors
    ///
    /// Returns [`LakeError::ObjectExists`] if the position is taken, or an
    /// I/O error if the write fails.
    fn append(
        &self,
        entity: &EntityType,
        position: &BronzePosition,
        records: &[BronzeRecord],
    ) -> Result<BronzeObjectRef>;

    /// Objects of `entity` strictly after `after` and ingested no later
    /// than `upper`, in position order.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the partition tree can't be read.
    fn list_after(
        &self,
        entity: &EntityType,
        after: Option<&BronzePosition>,
        upper: DateTime<Utc>,
    ) -> Result<Vec<BronzeObjectRef>>;

    /// Load every record of an object.
    ///
    /// # Errors
    ///
    /// Returns an I/O or serialization error if the object is unreadable.
    fn read(&self, object: &BronzeObjectRef) -> Result<Vec<BronzeRecord>>;
}

/// [`BronzeLog`] over a local (or mounted) directory tree.
pub struct FsBronzeLog {
    root: PathBuf,
}

impl FsBronzeLog {
    /// Bronze objects live under `<root>/bronze`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entity_dir(&self, entity: &EntityType) -> PathBuf {
        self.root.join("bronze").join(entity.as_str())
    }

    fn object_path(&self, entity: &EntityType, position: &BronzePosition) -> PathBuf {
        self.entity_dir(entity)
            .join(position.partition().path_segment())
            .join(format!("{}.{OBJECT_EXT}", position.to_key()))
    }

    /// Day partitions of `entity` within `[lower, upper]`, oldest first.
    fn day_partitions(
        &self,
        entity: &EntityType,
        lower: Option<NaiveDate>,
        upper: NaiveDate,
    ) -> Result<Vec<(PartitionCoords, PathBuf)>> {
        let lower_key = lower.map(PartitionCoords::from_date);
        let upper_key = PartitionCoords::from_date(upper);
        let mut out = Vec::new();

        for (year_raw, year_dir) in sub_dirs(&self.entity_dir(entity), "year=")? {
            let Ok(year) = year_raw.parse::<i32>() else {
                continue;
            };
            if year > upper_key.year || lower_key.is_some_and(|l| year < l.year) {
                continue;
            }
            for (month_raw, month_dir) in sub_dirs(&year_dir, "month=")? {
                let Ok(month) = month_raw.parse::<u32>() else {
                    continue;
                };
                if (year, month) > (upper_key.year, upper_key.month)
                    || lower_key.is_some_and(|l| (year, month) < (l.year, l.month))
                {
                    continue;
                }
                for (day_raw, day_dir) in sub_dirs(&month_dir, "day=")? {
                    let Ok(day) = day_raw.parse::<u32>() else {
                        continue;
                    };
                    let coords = PartitionCoords { year, month, day };
                    if coords.date().is_none()
                        || coords > upper_key
                        || lower_key.is_some_and(|l| coords < l)
                    {
                        continue;
                    }
                    out.push((coords, day_dir));
                }
            }
        }

        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

impl BronzeLog for FsBronzeLog {
    fn append(
        &self,
        entity: &EntityType,
        position: &BronzePosition,
        records: &[BronzeRecord],
    ) -> Result<BronzeObjectRef> {
        let path = self.object_path(entity, position);
        if path.exists() {
            return Err(LakeError::ObjectExists { path });
        }

        let mut body = Vec::new();
        for record in records {
            serde_json::to_writer(&mut body, record)
                .map_err(|e| LakeError::json(format!("encode {}", path.display()), e))?;
            body.push(b'\n');
        }
        write_object_atomic(&path, &body)?;

        tracing::debug!(
            entity = entity.as_str(),
            position = %position,
            records = records.len(),
            "Bronze object written"
        );

        Ok(BronzeObjectRef {
            entity: entity.clone(),
            position: position.clone(),
            path,
        })
    }

    fn list_after(
        &self,
        entity: &EntityType,
        after: Option<&BronzePosition>,
        upper: DateTime<Utc>,
    ) -> Result<Vec<BronzeObjectRef>> {
        let lower = after.and_then(|p| p.partition().date());
        let mut out = Vec::new();

        for (_coords, day_dir) in self.day_partitions(entity, lower, upper.date_naive())? {
            let entries = std::fs::read_dir(&day_dir).map_err(|e| LakeError::io(&day_dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| LakeError::io(&day_dir, e))?;
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                // Skip in-flight temp files.
                if name.starts_with('.') {
                    continue;
                }
                let Some(stem) = name.strip_suffix(&format!(".{OBJECT_EXT}")) else {
                    continue;
                };
                let Some(position) = BronzePosition::parse_key(stem) else {
                    tracing::warn!(path = %path.display(), "Ignoring unrecognised bronze object name");
                    continue;
                };
                if after.is_some_and(|a| position <= *a) || position.ingested_at > upper {
                    continue;
                }
                out.push(BronzeObjectRef {
                    entity: entity.clone(),
                    position,
                    path,
                });
            }
        }

        out.sort_by(|a, b| a.position.cmp(&b.position));
        Ok(out)
    }

    fn read(&self, object: &BronzeObjectRef) -> Result<Vec<BronzeRecord>> {
        let raw =
            std::fs::read_to_string(&object.path).map_err(|e| LakeError::io(&object.path, e))?;
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|e| {
                    LakeError::json(format!("{}:{}", object.path.display(), idx + 1), e)
                })
            })
            .collect()
    }
}

/// Subdirectories of `dir` named `<prefix><value>`, as `(value, path)`.
/// A missing directory yields nothing.
fn sub_dirs(dir: &Path, prefix: &str) -> Result<Vec<(String, PathBuf)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(LakeError::io(dir, e)),
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LakeError::io(dir, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(value) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(prefix))
        {
            out.push((value.to_string(), path.clone()));
        }
    }
    Ok(out)
}

fn write_object_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| LakeError::corrupt(path.display().to_string(), "object path has no parent"))?;
    std::fs::create_dir_all(parent).map_err(|e| LakeError::io(parent, e))?;

    let filename = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("object");
    let tmp = parent.join(format!(
        ".{}.{}.{}.tmp",
        filename,
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));

    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()
    };
    if let Err(e) = write() {
        let _ = std::fs::remove_file(&tmp);
        return Err(LakeError::io(&tmp, e));
    }

    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(LakeError::io(path, e));
    }
    Ok(())
}
