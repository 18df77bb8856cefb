pub mod aggregate;
pub mod check;
pub mod ingest;
pub mod reconcile;
pub mod run;
pub mod status;

use std::path::Path;

use anyhow::{Context, Result};
use medallion_engine::config::types::PipelineConfig;
use medallion_engine::config::{parse_pipeline, validate_pipeline};

/// Parse and validate a pipeline file.
pub(crate) fn load_pipeline(pipeline_path: &Path) -> Result<PipelineConfig> {
    let config = parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    validate_pipeline(&config)?;

    tracing::info!(
        pipeline = config.pipeline,
        source = %config.source.path.display(),
        entities = config.entities.len(),
        "Pipeline validated"
    );
    Ok(config)
}
