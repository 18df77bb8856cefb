use std::path::Path;

use anyhow::Result;
use medallion_engine::{open_source, IngestOptions, IngestResult, Pipeline};

/// Execute the `ingest` command: land source changes in bronze.
pub async fn execute(pipeline_path: &Path, max_batches: Option<u64>) -> Result<()> {
    let config = super::load_pipeline(pipeline_path)?;
    let source = open_source(&config);
    let pipeline = Pipeline::open(config)?;

    let result = pipeline
        .ingest(
            source,
            IngestOptions {
                max_batches,
                now: None,
            },
        )
        .await?;

    println!(
        "Ingest for '{}' completed.",
        pipeline.pipeline_id().as_str()
    );
    print_ingest(&result);
    Ok(())
}

pub(crate) fn print_ingest(result: &IngestResult) {
    println!("  Batches:           {}", result.batches);
    println!("  Records read:      {}", result.records_read);
    println!("  Records written:   {}", result.records_written);
    println!("  Quarantined:       {}", result.records_quarantined);
    if result.removes_dropped > 0 {
        println!("  Removes dropped:   {}", result.removes_dropped);
    }
    println!("  Bronze objects:    {}", result.objects_written);
    match result.committed_position {
        Some(position) => println!("  Source offset:     {position}"),
        None => println!("  Source offset:     (unchanged)"),
    }
    println!("  Duration:          {:.2}s", result.duration_secs);
    if result.retry_count > 0 {
        println!("  Retries:           {}", result.retry_count);
    }
}
