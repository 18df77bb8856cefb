//! Pipeline error model and retry backoff policy helpers.

use std::time::Duration;

use medallion_lake::LakeError;
use medallion_state::StateError;
use medallion_types::error::{BackoffClass, StageError};

const BACKOFF_FAST_BASE_MS: u64 = 100;
const BACKOFF_NORMAL_BASE_MS: u64 = 1_000;
const BACKOFF_SLOW_BASE_MS: u64 = 5_000;
const BACKOFF_MAX_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// PipelineError: categorised errors for retry decisions
// ---------------------------------------------------------------------------

/// Categorized pipeline error for retry decisions.
///
/// `Stage` wraps a typed [`StageError`] with retry metadata. Storage
/// failures that may clear on their own arrive here as `transient_io`.
///
/// `Infrastructure` wraps opaque failures (corrupt state, task panics,
/// misconfigured stores) that are never retried.
#[derive(Debug)]
pub enum PipelineError {
    /// Typed stage error with retry metadata.
    Stage(StageError),
    /// Infrastructure error (corrupt storage, task panic, etc.)
    Infrastructure(anyhow::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stage(e) => write!(f, "{e}"),
            Self::Infrastructure(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl From<StageError> for PipelineError {
    fn from(e: StageError) -> Self {
        Self::Stage(e)
    }
}

impl From<LakeError> for PipelineError {
    fn from(e: LakeError) -> Self {
        if e.is_transient() {
            return Self::Stage(StageError::transient_io("STORAGE_IO", e.to_string()));
        }
        match e {
            LakeError::EventMutated {
                entity,
                primary_key,
                event_id,
            } => Self::Stage(
                StageError::merge_invariant(
                    "EVENT_MUTATED",
                    format!("event {event_id} re-delivered with a different version"),
                )
                .with_details(serde_json::json!({
                    "entity": entity,
                    "primary_key": primary_key,
                    "event_id": event_id,
                })),
            ),
            other => Self::Infrastructure(anyhow::Error::new(other)),
        }
    }
}

impl From<StateError> for PipelineError {
    fn from(e: StateError) -> Self {
        if e.is_transient() {
            Self::Stage(StageError::transient_io("STATE_IO", e.to_string()))
        } else {
            Self::Infrastructure(anyhow::Error::new(e))
        }
    }
}

impl PipelineError {
    /// Returns `true` if this is a typed stage error marked as retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Stage(e) => e.retryable,
            Self::Infrastructure(_) => false,
        }
    }

    /// Returns the typed stage error if this is a `Stage` variant.
    pub fn as_stage_error(&self) -> Option<&StageError> {
        match self {
            Self::Stage(e) => Some(e),
            Self::Infrastructure(_) => None,
        }
    }

    /// Wrap a panicked or cancelled blocking task.
    pub(crate) fn task_failed(task: &str, err: &tokio::task::JoinError) -> Self {
        Self::Infrastructure(anyhow::anyhow!("{task} task panicked: {err}"))
    }
}

/// Compute retry delay based on error hints and attempt number.
pub(crate) fn compute_backoff(err: &StageError, attempt: u32) -> Duration {
    if let Some(ms) = err.retry_after_ms {
        return Duration::from_millis(ms);
    }

    let base_ms: u64 = match err.backoff_class {
        BackoffClass::Fast => BACKOFF_FAST_BASE_MS,
        BackoffClass::Normal => BACKOFF_NORMAL_BASE_MS,
        BackoffClass::Slow => BACKOFF_SLOW_BASE_MS,
    };

    let exponent = attempt.saturating_sub(1).min(31);
    let delay_ms = base_ms.saturating_mul(2u64.pow(exponent));
    Duration::from_millis(delay_ms.min(BACKOFF_MAX_MS))
}
