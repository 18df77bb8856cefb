use std::path::Path;

use anyhow::{Context, Result};
use medallion_engine::check_pipeline;
use medallion_engine::config::parse_pipeline;

/// Execute the `check` command: validate config and probe every store.
pub fn execute(pipeline_path: &Path) -> Result<()> {
    let config = parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    let result = check_pipeline(&config);

    print_component("Pipeline config", result.config_ok);
    print_component("Change source", result.source_ok);
    print_component("State backend", result.state_ok);
    print_component("Bronze layer", result.bronze_ok);
    print_component("Silver store", result.silver_ok);
    print_component("Gold store", result.gold_ok);

    for problem in &result.problems {
        println!("  {problem}");
    }

    if result.all_ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}

fn print_component(label: &str, ok: bool) {
    println!("{:18} {}", format!("{label}:"), if ok { "OK" } else { "FAILED" });
}
