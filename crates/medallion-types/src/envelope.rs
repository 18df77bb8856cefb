//! Dead-letter record type.
//!
//! [`DlqRecord`] captures raw events that could not be decoded so they
//! can be inspected by hand without blocking the batch they arrived in.

use crate::error::ErrorCategory;
use serde::{Deserialize, Serialize};
use std::fmt;

/// ISO-8601 formatted timestamp string.
///
/// Thin wrapper providing type clarity at storage boundaries. No format
/// validation; callers are trusted to provide valid ISO-8601 strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    /// Create a new timestamp from an ISO-8601 string.
    #[must_use]
    pub fn new(iso8601: impl Into<String>) -> Self {
        Self(iso8601.into())
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event that failed decoding, routed to the dead-letter sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqRecord {
    /// Entity the event was addressed to, or the source name when unknown.
    pub stream_name: String,
    /// Raw event payload as received.
    pub record_json: String,
    /// Human-readable error description.
    pub error_message: String,
    /// Error classification.
    pub error_category: ErrorCategory,
    /// When the failure occurred.
    pub failed_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_transparent_serde() {
        let ts = Timestamp::new("2026-01-15T10:30:00Z");
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"2026-01-15T10:30:00Z\"");
    }

    #[test]
    fn dlq_record_roundtrip() {
        let rec = DlqRecord {
            stream_name: "orders".into(),
            record_json: r#"{"eventName":"INSERT"}"#.into(),
            error_message: "missing eventSourceARN".into(),
            error_category: ErrorCategory::MalformedEvent,
            failed_at: Timestamp::new("2026-01-15T10:30:00Z"),
        };
        let json = serde_json::to_string(&rec).unwrap();
        let back: DlqRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, back);
    }
}
