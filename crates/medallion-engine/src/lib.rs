//! Stage engine of the medallion pipeline: change decoding, bronze ingest,
//! silver reconciliation, gold aggregation and their orchestration.

pub mod bronze;
pub(crate) mod checkpoint;
pub mod config;
pub mod decode;
pub(crate) mod dlq;
pub mod errors;
pub mod execution;
pub mod gold;
pub mod orchestrator;
pub mod result;
pub mod silver;
pub mod source;
pub mod transform;

// Re-export public API for convenience
pub use errors::PipelineError;
pub use execution::{AggregateOptions, IngestOptions, ReconcileOptions, RefreshMode};
pub use orchestrator::{check_pipeline, open_source, Pipeline};
pub use result::{AggregateResult, CheckResult, IngestResult, PipelineStatus, ReconcileResult};
