//! Per-invocation options of the stage runs and their time budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use medallion_types::error::StageError;

/// Runtime options of an ingest run (not part of pipeline YAML config).
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Stop after this many non-empty batches. `None` drains the source.
    pub max_batches: Option<u64>,
    /// Ingestion clock override.
    pub now: Option<DateTime<Utc>>,
}

/// Runtime options of a reconcile pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Restrict the pass to these entities. Empty means all.
    pub entities: Vec<String>,
    /// Pass clock override; the settle lag is subtracted from it.
    pub now: Option<DateTime<Utc>>,
}

/// How much of gold a refresh recomputes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefreshMode {
    /// Hot window only, plus cold history on the first run.
    #[default]
    Incremental,
    /// Every dataset from all of silver.
    Full,
}

/// Runtime options of a gold refresh.
#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    pub mode: RefreshMode,
    /// Business date override.
    pub today: Option<NaiveDate>,
}

/// Wall-clock budget shared by the tasks of one stage run.
///
/// Cancellation is cooperative: blocking tasks check the budget before
/// each commit point and stop without committing once it is spent.
#[derive(Debug, Clone)]
pub struct StageBudget {
    deadline: Instant,
    timeout: Duration,
    cancelled: Arc<AtomicBool>,
}

impl StageBudget {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_spent(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || Instant::now() >= self.deadline
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fail with a `Timeout` error once the budget is spent.
    ///
    /// # Errors
    ///
    /// Returns `STAGE_TIMEOUT` when the deadline passed or the run was
    /// cancelled.
    pub fn check(&self, at: &str) -> Result<(), StageError> {
        if self.is_spent() {
            return Err(self.exceeded(at));
        }
        Ok(())
    }

    #[must_use]
    pub fn exceeded(&self, at: &str) -> StageError {
        StageError::timeout(
            "STAGE_TIMEOUT",
            format!(
                "stage exceeded its {}s budget before {at}",
                self.timeout.as_secs()
            ),
        )
    }
}
