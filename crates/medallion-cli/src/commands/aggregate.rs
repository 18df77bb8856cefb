use std::path::Path;

use anyhow::Result;
use chrono::NaiveDate;
use medallion_engine::{AggregateOptions, AggregateResult, Pipeline, RefreshMode};

/// Execute the `aggregate` command: refresh the gold datasets.
pub async fn execute(
    pipeline_path: &Path,
    full_refresh: bool,
    today: Option<NaiveDate>,
) -> Result<()> {
    let config = super::load_pipeline(pipeline_path)?;
    let pipeline = Pipeline::open(config)?;

    let mode = if full_refresh {
        RefreshMode::Full
    } else {
        RefreshMode::Incremental
    };
    let result = pipeline.aggregate(AggregateOptions { mode, today }).await?;

    println!(
        "Aggregate for '{}' completed.",
        pipeline.pipeline_id().as_str()
    );
    print_aggregate(&result);
    Ok(())
}

pub(crate) fn print_aggregate(result: &AggregateResult) {
    let scope = if result.full_refresh {
        "full"
    } else {
        "hot window"
    };
    println!("  Refresh:           {scope} (window from {})", result.window_start);
    println!("  Orders read:       {}", result.orders_read);
    if result.skipped_orders > 0 {
        println!("  Orders skipped:    {}", result.skipped_orders);
    }
    println!(
        "  Daily sales:       {} written, {} replaced",
        result.daily_sales_written, result.daily_sales_replaced
    );
    println!("  Products:          {}", result.products_written);
    println!("  Key metrics:       {}", result.metrics_written);
    println!("  Duration:          {:.2}s", result.duration_secs);
    if result.retry_count > 0 {
        println!("  Retries:           {}", result.retry_count);
    }
}
