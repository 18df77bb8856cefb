//! Watermark advancement after a successful reconciliation pass.

use medallion_state::StateBackend;
use medallion_types::bronze::BronzePosition;
use medallion_types::error::StageError;
use medallion_types::state::{PipelineId, StateKey};

use crate::errors::PipelineError;
use crate::silver::EntityPassOutcome;

/// Compare-and-set each entity's watermark from the position the pass
/// started at to the greatest position it merged. Returns the number of
/// watermarks advanced.
///
/// A watermark only moves forward: a proposal at or below the previous
/// position is a merge invariant violation, and a watermark that moved
/// under the pass is a conflict.
pub(crate) fn advance_watermarks(
    state_backend: &dyn StateBackend,
    pipeline: &PipelineId,
    outcomes: &[EntityPassOutcome],
) -> Result<u64, PipelineError> {
    let mut advanced = 0u64;

    for outcome in outcomes {
        let Some(position) = &outcome.new_position else {
            continue;
        };

        if let Some(previous) = outcome.previous.as_deref() {
            let regressed = BronzePosition::parse_key(previous).map_or(true, |p| *position <= p);
            if regressed {
                return Err(StageError::merge_invariant(
                    "WATERMARK_REGRESSION",
                    format!(
                        "watermark of '{}' would move from {previous} to {position}",
                        outcome.entity
                    ),
                )
                .into());
            }
        }

        let key = StateKey::silver(&outcome.entity);
        let value = position.to_key();
        let swapped = state_backend.compare_and_set(
            pipeline,
            &key,
            outcome.previous.as_deref(),
            &value,
        )?;
        if !swapped {
            return Err(StageError::watermark_conflict(
                "WATERMARK_MOVED",
                format!("watermark '{key}' changed during the pass"),
            )
            .into());
        }

        tracing::info!(
            pipeline = pipeline.as_str(),
            entity = outcome.entity.as_str(),
            watermark = value,
            "Watermark advanced"
        );
        advanced += 1;
    }

    Ok(advanced)
}
