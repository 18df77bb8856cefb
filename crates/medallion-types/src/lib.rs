//! Shared model types for the medallion CDC pipeline.
//!
//! This crate carries no I/O: change events, bronze/silver/gold rows,
//! state-backend model types and the stage error model.

pub mod bronze;
pub mod envelope;
pub mod error;
pub mod event;
pub mod gold;
pub mod silver;
pub mod state;
