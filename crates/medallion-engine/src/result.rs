//! Stage run result types.

use chrono::NaiveDate;
use medallion_lake::EntityCounts;
use medallion_types::envelope::DlqRecord;
use medallion_types::state::{StateKey, WatermarkState};

use crate::silver::EntityPassOutcome;

/// Result of an ingest run.
#[derive(Debug, Clone, Default)]
pub struct IngestResult {
    pub batches: u64,
    pub records_read: u64,
    pub records_written: u64,
    pub records_quarantined: u64,
    pub removes_dropped: u64,
    pub objects_written: u64,
    /// Source offset committed by the run's last batch.
    pub committed_position: Option<u64>,
    pub duration_secs: f64,
    pub retry_count: u32,
}

/// Per-entity figures of a reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityReconcileResult {
    pub entity: String,
    pub objects_read: u64,
    pub records_read: u64,
    pub winners: u64,
    pub inserted: u64,
    pub updated: u64,
    pub tombstoned: u64,
    pub skipped_stale: u64,
    /// Watermark after the pass.
    pub watermark: Option<String>,
}

impl From<&EntityPassOutcome> for EntityReconcileResult {
    fn from(outcome: &EntityPassOutcome) -> Self {
        Self {
            entity: outcome.entity.to_string(),
            objects_read: outcome.objects_read,
            records_read: outcome.records_read,
            winners: outcome.winners,
            inserted: outcome.summary.inserted,
            updated: outcome.summary.updated,
            tombstoned: outcome.summary.tombstoned,
            skipped_stale: outcome.summary.skipped_stale,
            watermark: outcome
                .new_position
                .as_ref()
                .map(|p| p.to_key())
                .or_else(|| outcome.previous.clone()),
        }
    }
}

/// Result of a reconcile run.
#[derive(Debug, Clone, Default)]
pub struct ReconcileResult {
    pub entities: Vec<EntityReconcileResult>,
    pub duration_secs: f64,
    pub retry_count: u32,
}

impl ReconcileResult {
    #[must_use]
    pub fn records_read(&self) -> u64 {
        self.entities.iter().map(|e| e.records_read).sum()
    }

    #[must_use]
    pub fn rows_applied(&self) -> u64 {
        self.entities
            .iter()
            .map(|e| e.inserted + e.updated + e.tombstoned)
            .sum()
    }
}

/// Result of a gold refresh.
#[derive(Debug, Clone)]
pub struct AggregateResult {
    pub full_refresh: bool,
    pub window_start: NaiveDate,
    pub orders_read: u64,
    pub skipped_orders: u64,
    pub daily_sales_written: u64,
    pub daily_sales_replaced: u64,
    pub products_written: u64,
    pub metrics_written: u64,
    pub duration_secs: f64,
    pub retry_count: u32,
}

/// Result of a pipeline check.
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    pub config_ok: bool,
    pub source_ok: bool,
    pub state_ok: bool,
    pub bronze_ok: bool,
    pub silver_ok: bool,
    pub gold_ok: bool,
    /// One message per failed component.
    pub problems: Vec<String>,
}

impl CheckResult {
    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.config_ok
            && self.source_ok
            && self.state_ok
            && self.bronze_ok
            && self.silver_ok
            && self.gold_ok
    }
}

/// Silver row counts of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityStatus {
    pub entity: String,
    pub counts: EntityCounts,
}

/// Snapshot of the pipeline's persisted progress.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub watermarks: Vec<(StateKey, WatermarkState)>,
    pub entities: Vec<EntityStatus>,
    pub cold_frontier: Option<NaiveDate>,
    pub recent_dlq: Vec<DlqRecord>,
}
