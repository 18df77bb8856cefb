//! Durable storage for the medallion layers.
//!
//! [`BronzeLog`] holds immutable raw batches, [`SilverStore`] the
//! version-guarded canonical rows, and [`GoldStore`] the aggregates
//! derived from them. Every store is `Send + Sync` so stages can share it
//! behind an `Arc`.

#![warn(clippy::pedantic)]

pub mod bronze;
mod db;
pub mod error;
pub mod gold;
pub mod silver;

pub use bronze::{BronzeLog, BronzeObjectRef, FsBronzeLog};
pub use error::LakeError;
pub use gold::{DailySalesScope, GoldPublish, GoldStore, PublishSummary, SqliteGoldStore};
pub use silver::{EntityCounts, MergeSummary, SilverStore, SqliteSilverStore};
