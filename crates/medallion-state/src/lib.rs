//! Pipeline state persistence for the medallion pipeline.
//!
//! Provides the [`StateBackend`] trait and a [`SqliteStateBackend`]
//! implementation for watermarks, source offsets, reconciliation leases,
//! run history and dead-letter storage.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod sqlite;

pub use backend::StateBackend;
pub use error::StateError;
pub use sqlite::SqliteStateBackend;

/// Common imports for typical usage.
pub mod prelude {
    pub use crate::backend::StateBackend;
    pub use crate::error::StateError;
    pub use crate::sqlite::SqliteStateBackend;
    pub use medallion_types::envelope::{DlqRecord, Timestamp};
    pub use medallion_types::state::{
        PipelineId, RunStats, RunStatus, Stage, StateKey, WatermarkState,
    };
}
