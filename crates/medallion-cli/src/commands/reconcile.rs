use std::path::Path;

use anyhow::Result;
use medallion_engine::{Pipeline, ReconcileOptions, ReconcileResult};

/// Execute the `reconcile` command: merge settled bronze into silver.
pub async fn execute(pipeline_path: &Path, entities: Vec<String>) -> Result<()> {
    let config = super::load_pipeline(pipeline_path)?;
    let pipeline = Pipeline::open(config)?;

    let result = pipeline
        .reconcile(ReconcileOptions {
            entities,
            now: None,
        })
        .await?;

    println!(
        "Reconcile for '{}' completed.",
        pipeline.pipeline_id().as_str()
    );
    print_reconcile(&result);
    Ok(())
}

pub(crate) fn print_reconcile(result: &ReconcileResult) {
    println!(
        "  {:14} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  watermark",
        "entity", "objects", "read", "inserted", "updated", "deleted", "stale"
    );
    for entity in &result.entities {
        println!(
            "  {:14} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  {}",
            entity.entity,
            entity.objects_read,
            entity.records_read,
            entity.inserted,
            entity.updated,
            entity.tombstoned,
            entity.skipped_stale,
            entity.watermark.as_deref().unwrap_or("-"),
        );
    }
    println!("  Records read:      {}", result.records_read());
    println!("  Rows applied:      {}", result.rows_applied());
    println!("  Duration:          {:.2}s", result.duration_secs);
    if result.retry_count > 0 {
        println!("  Retries:           {}", result.retry_count);
    }
}
