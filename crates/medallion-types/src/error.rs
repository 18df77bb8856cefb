//! Structured error model for pipeline stages.
//!
//! [`StageError`] carries classification, retry metadata, and optional
//! diagnostic details. Construct via category-specific factory methods.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a stage error.
///
/// Determines default retry behavior and operator-facing categorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Storage or source I/O hiccup (retryable).
    TransientIo,
    /// A single event could not be decoded or is missing required fields.
    MalformedEvent,
    /// Another pass already holds the reconciliation lease.
    WatermarkConflict,
    /// Out-of-order or duplicate-key corruption detected during merge.
    MergeInvariant,
    /// Invalid pipeline configuration.
    Config,
    /// Stage exceeded its time budget.
    Timeout,
    /// Internal error.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TransientIo => "transient_io",
            Self::MalformedEvent => "malformed_event",
            Self::WatermarkConflict => "watermark_conflict",
            Self::MergeInvariant => "merge_invariant",
            Self::Config => "config",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Blast radius of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorScope {
    /// Aborts the current stage run.
    Pass,
    /// Affects a single batch.
    Batch,
    /// Affects an individual event.
    Record,
}

impl fmt::Display for ErrorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "pass",
            Self::Batch => "batch",
            Self::Record => "record",
        };
        f.write_str(s)
    }
}

/// Retry backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffClass {
    /// Millisecond-scale retry.
    Fast,
    /// Second-scale retry.
    Normal,
    /// Minute-scale retry.
    Slow,
}

/// Structured error from a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{category}] {code}: {message}")]
pub struct StageError {
    pub category: ErrorCategory,
    pub scope: ErrorScope,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub backoff_class: BackoffClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StageError {
    fn new(
        category: ErrorCategory,
        scope: ErrorScope,
        retryable: bool,
        backoff_class: BackoffClass,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            scope,
            code: code.into(),
            message: message.into(),
            retryable,
            retry_after_ms: None,
            backoff_class,
            details: None,
        }
    }

    /// Transient storage/source error (retryable, fast backoff).
    #[must_use]
    pub fn transient_io(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::TransientIo, ErrorScope::Batch, true, BackoffClass::Fast, code, message)
    }

    /// Undecodable event (not retryable, record scope).
    #[must_use]
    pub fn malformed_event(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::MalformedEvent, ErrorScope::Record, false, BackoffClass::Normal, code, message)
    }

    /// Reconciliation lease held elsewhere (not retryable).
    #[must_use]
    pub fn watermark_conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::WatermarkConflict, ErrorScope::Pass, false, BackoffClass::Normal, code, message)
    }

    /// Merge corruption (fatal for the pass).
    #[must_use]
    pub fn merge_invariant(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::MergeInvariant, ErrorScope::Pass, false, BackoffClass::Normal, code, message)
    }

    /// Configuration error (not retryable).
    #[must_use]
    pub fn config(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Config, ErrorScope::Pass, false, BackoffClass::Normal, code, message)
    }

    /// Time budget exceeded (not retryable within the same run).
    #[must_use]
    pub fn timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, ErrorScope::Pass, false, BackoffClass::Normal, code, message)
    }

    /// Internal error (not retryable).
    #[must_use]
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, ErrorScope::Pass, false, BackoffClass::Normal, code, message)
    }

    /// Attach structured diagnostic details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Ask the retry loop to wait at least this long.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    /// Override the default error scope.
    #[must_use]
    pub fn with_scope(mut self, scope: ErrorScope) -> Self {
        self.scope = scope;
        self
    }

    /// Whether operators must be alerted (corruption, not load).
    #[must_use]
    pub fn requires_alert(&self) -> bool {
        self.category == ErrorCategory::MergeInvariant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_io_is_retryable_with_fast_backoff() {
        let err = StageError::transient_io("WRITE_FAILED", "disk busy");
        assert_eq!(err.category, ErrorCategory::TransientIo);
        assert!(err.retryable);
        assert_eq!(err.backoff_class, BackoffClass::Fast);
    }

    #[test]
    fn malformed_event_is_record_scoped() {
        let err = StageError::malformed_event("MISSING_KEY", "no primary key");
        assert_eq!(err.scope, ErrorScope::Record);
        assert!(!err.retryable);
    }

    #[test]
    fn watermark_conflict_is_not_retried() {
        let err = StageError::watermark_conflict("LEASE_HELD", "orders busy");
        assert!(!err.retryable);
        assert!(!err.requires_alert());
    }

    #[test]
    fn merge_invariant_requires_alert() {
        let err = StageError::merge_invariant("EVENT_MUTATED", "same id, new version");
        assert!(err.requires_alert());
        assert_eq!(err.scope, ErrorScope::Pass);
    }

    #[test]
    fn serde_roundtrip() {
        let err = StageError::transient_io("THROTTLED", "slow down")
            .with_retry_after(250)
            .with_details(serde_json::json!({"path": "bronze/orders"}));
        let json = serde_json::to_string(&err).unwrap();
        let back: StageError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }

    #[test]
    fn display_format() {
        let err = StageError::config("BAD_WINDOW", "hot_window_days must be > 0");
        assert_eq!(
            err.to_string(),
            "[config] BAD_WINDOW: hot_window_days must be > 0"
        );
    }
}
