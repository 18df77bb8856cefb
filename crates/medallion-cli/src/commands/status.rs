use std::path::Path;

use anyhow::Result;
use medallion_engine::Pipeline;

/// Execute the `status` command: show progress markers and silver sizes.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let config = super::load_pipeline(pipeline_path)?;
    let pipeline = Pipeline::open(config)?;
    let status = pipeline.status().await?;

    println!("Pipeline '{}'", pipeline.pipeline_id().as_str());

    println!("Watermarks:");
    if status.watermarks.is_empty() {
        println!("  (none)");
    }
    for (key, watermark) in &status.watermarks {
        println!(
            "  {:28} {}  (updated {})",
            key.as_str(),
            watermark.value,
            watermark.updated_at
        );
    }

    println!("Silver:");
    for entity in &status.entities {
        println!(
            "  {:14} {:>8} live {:>8} deleted",
            entity.entity, entity.counts.live, entity.counts.tombstoned
        );
    }

    match status.cold_frontier {
        Some(frontier) => println!("Gold cold frontier:  {frontier}"),
        None => println!("Gold cold frontier:  (never refreshed)"),
    }

    if !status.recent_dlq.is_empty() {
        println!("Recent quarantined records:");
        for record in &status.recent_dlq {
            println!(
                "  {} [{}] {}: {}",
                record.failed_at, record.error_category, record.stream_name, record.error_message
            );
        }
    }

    Ok(())
}
