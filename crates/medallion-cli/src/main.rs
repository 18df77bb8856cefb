mod commands;
mod logging;

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "medallion",
    version,
    about = "CDC pipeline from operational change streams to bronze, silver and gold layers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Land raw change records in the bronze layer
    Ingest {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Stop after this many batches instead of draining the source
        #[arg(long)]
        max_batches: Option<u64>,
    },
    /// Reconcile settled bronze objects into the silver layer
    Reconcile {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Restrict the pass to this entity (repeatable)
        #[arg(long = "entity")]
        entities: Vec<String>,
    },
    /// Refresh the gold aggregates from silver
    Aggregate {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Recompute cold history as well as the hot window
        #[arg(long)]
        full_refresh: bool,
        /// Business date to aggregate for (default: today, UTC)
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Ingest, reconcile and aggregate once
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Validate pipeline configuration and store access
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Show watermarks, silver row counts and quarantined records
    Status {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Ingest {
            pipeline,
            max_batches,
        } => commands::ingest::execute(&pipeline, max_batches).await,
        Commands::Reconcile { pipeline, entities } => {
            commands::reconcile::execute(&pipeline, entities).await
        }
        Commands::Aggregate {
            pipeline,
            full_refresh,
            today,
        } => commands::aggregate::execute(&pipeline, full_refresh, today).await,
        Commands::Run { pipeline } => commands::run::execute(&pipeline).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline),
        Commands::Status { pipeline } => commands::status::execute(&pipeline).await,
    }
}
