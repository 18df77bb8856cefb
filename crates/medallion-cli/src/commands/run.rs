use std::path::Path;

use anyhow::Result;
use medallion_engine::{
    open_source, AggregateOptions, IngestOptions, Pipeline, ReconcileOptions,
};

use super::aggregate::print_aggregate;
use super::ingest::print_ingest;
use super::reconcile::print_reconcile;

/// Execute the `run` command: one ingest, reconcile and aggregate cycle.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let config = super::load_pipeline(pipeline_path)?;
    let source = open_source(&config);
    let pipeline = Pipeline::open(config)?;

    let ingest = pipeline.ingest(source, IngestOptions::default()).await?;
    let reconcile = pipeline.reconcile(ReconcileOptions::default()).await?;
    let aggregate = pipeline.aggregate(AggregateOptions::default()).await?;

    println!(
        "Pipeline '{}' completed successfully.",
        pipeline.pipeline_id().as_str()
    );
    println!("Bronze:");
    print_ingest(&ingest);
    println!("Silver:");
    print_reconcile(&reconcile);
    println!("Gold:");
    print_aggregate(&aggregate);

    // Machine-readable summary for schedulers
    let json = serde_json::json!({
        "records_read": ingest.records_read,
        "records_written": ingest.records_written,
        "records_quarantined": ingest.records_quarantined,
        "objects_written": ingest.objects_written,
        "committed_position": ingest.committed_position,
        "silver_records_read": reconcile.records_read(),
        "silver_rows_applied": reconcile.rows_applied(),
        "gold_full_refresh": aggregate.full_refresh,
        "gold_window_start": aggregate.window_start.to_string(),
        "daily_sales_written": aggregate.daily_sales_written,
        "products_written": aggregate.products_written,
        "duration_secs": ingest.duration_secs + reconcile.duration_secs + aggregate.duration_secs,
        "retry_count": ingest.retry_count + reconcile.retry_count + aggregate.retry_count,
    });
    println!("@@RUN_JSON@@{json}");

    Ok(())
}
