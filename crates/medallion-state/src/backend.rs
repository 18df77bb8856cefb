//! State backend trait definition.
//!
//! [`StateBackend`] defines the storage contract for watermarks, source
//! offsets, reconciliation leases, run history and dead-letter records.
//! Model types live in [`medallion_types::state`].

use std::time::Duration;

use medallion_types::envelope::DlqRecord;
use medallion_types::state::{PipelineId, RunStats, RunStatus, Stage, StateKey, WatermarkState};

use crate::error;

/// Storage contract for pipeline state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateBackend>`.
pub trait StateBackend: Send + Sync {
    /// Read the watermark for a (pipeline, key) pair.
    ///
    /// Returns `Ok(None)` when nothing has been committed yet.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_watermark(
        &self,
        pipeline: &PipelineId,
        key: &StateKey,
    ) -> error::Result<Option<WatermarkState>>;

    /// Unconditionally upsert the watermark for a (pipeline, key) pair.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn set_watermark(&self, pipeline: &PipelineId, key: &StateKey, value: &str)
        -> error::Result<()>;

    /// Compare-and-set: atomically replace the watermark only if it still equals `expected`.
    ///
    /// Returns `true` if the update was applied, `false` if the stored value changed.
    /// When `expected` is `None`, succeeds only if no watermark exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn compare_and_set(
        &self,
        pipeline: &PipelineId,
        key: &StateKey,
        expected: Option<&str>,
        new_value: &str,
    ) -> error::Result<bool>;

    /// List every watermark of a pipeline, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_watermarks(&self, pipeline: &PipelineId)
        -> error::Result<Vec<(StateKey, WatermarkState)>>;

    /// Take the exclusive lease on `key` for `holder`.
    ///
    /// Succeeds when no lease exists or the existing one has expired.
    /// Returns `false` while another holder's lease is live.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn try_acquire_lease(
        &self,
        pipeline: &PipelineId,
        key: &StateKey,
        holder: &str,
        ttl: Duration,
    ) -> error::Result<bool>;

    /// Drop a lease previously granted to `holder`. Returns `false` if it was not held.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn release_lease(&self, pipeline: &PipelineId, key: &StateKey, holder: &str)
        -> error::Result<bool>;

    /// Begin a new stage run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, pipeline: &PipelineId, stage: Stage) -> error::Result<i64>;

    /// Finalize a stage run with status and aggregate stats.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()>;

    /// Persist dead-letter records. Returns the count inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn insert_dlq_records(
        &self,
        pipeline: &PipelineId,
        run_id: i64,
        records: &[DlqRecord],
    ) -> error::Result<u64>;

    /// Most recent dead-letter records first, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_dlq_records(&self, pipeline: &PipelineId, limit: usize)
        -> error::Result<Vec<DlqRecord>>;
}
