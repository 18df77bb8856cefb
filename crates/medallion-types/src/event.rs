//! Change events and the version order used to reconcile them.
//!
//! A [`ChangeEvent`] is one insert/modify/remove emitted by the CDC
//! source for a single `(entity, primary_key)`. Events are immutable once
//! emitted; the engine never rewrites one, it only decides which version
//! of a key wins.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Logical entity name (e.g. `"orders"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Create a new entity type.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for EntityType {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Kind of change captured by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Insert,
    Modify,
    Remove,
}

impl Operation {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Modify => "MODIFY",
            Self::Remove => "REMOVE",
        }
    }

    /// Parse the wire-format string. Matching is case-insensitive.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "INSERT" => Some(Self::Insert),
            "MODIFY" => Some(Self::Modify),
            "REMOVE" => Some(Self::Remove),
            _ => None,
        }
    }

    /// `true` for operations that delete the key.
    #[must_use]
    pub fn is_remove(self) -> bool {
        matches!(self, Self::Remove)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-partition sequence number assigned by the source.
///
/// Stream sequence numbers are decimal strings that can exceed `u128`,
/// so they are kept as text and compared numerically: shorter digit
/// strings are smaller, equal lengths compare lexically. Leading zeros
/// are ignored. Non-numeric markers fall back to plain lexical order
/// after all numeric ones. Equality and hashing follow the same order, so
/// `"042"` and `"42"` are one marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceMarker(String);

impl SequenceMarker {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric_digits(&self) -> Option<&str> {
        if self.0.is_empty() || !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let trimmed = self.0.trim_start_matches('0');
        Some(if trimmed.is_empty() { "0" } else { trimmed })
    }
}

impl Ord for SequenceMarker {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric_digits(), other.numeric_digits()) {
            (Some(a), Some(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialEq for SequenceMarker {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SequenceMarker {}

impl Hash for SequenceMarker {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.numeric_digits() {
            Some(digits) => {
                0u8.hash(state);
                digits.hash(state);
            }
            None => {
                1u8.hash(state);
                self.0.hash(state);
            }
        }
    }
}

impl PartialOrd for SequenceMarker {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Total order over versions of the same key.
///
/// Later `timestamp` wins, then greater `sequence` (absent sorts lowest),
/// and on a full tie the lexically *smaller* `event_id` wins. The last
/// rule is encoded by reversing the id comparison, so "greater version"
/// always means "wins".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventVersion {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceMarker>,
    pub event_id: String,
}

impl Ord for EventVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.sequence.cmp(&other.sequence))
            .then_with(|| other.event_id.cmp(&self.event_id))
    }
}

impl PartialOrd for EventVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A single change captured from an operational table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_id: String,
    pub entity_type: EntityType,
    pub operation: Operation,
    pub event_timestamp: DateTime<Utc>,
    pub primary_key: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_marker: Option<SequenceMarker>,
}

impl ChangeEvent {
    /// Version of this event for conflict resolution.
    #[must_use]
    pub fn version(&self) -> EventVersion {
        EventVersion {
            timestamp: self.event_timestamp,
            sequence: self.sequence_marker.clone(),
            event_id: self.event_id.clone(),
        }
    }
}
