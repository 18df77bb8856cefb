//! Silver-layer canonical rows and the upserts that produce them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{ChangeEvent, EntityType, EventVersion, Operation, SequenceMarker};

/// Canonical change ready to be merged into the silver dataset.
///
/// Produced from the winning [`ChangeEvent`] of each key by a record
/// transformer. A `Remove` upsert carries no attributes and tombstones
/// the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SilverUpsert {
    pub entity_type: EntityType,
    pub primary_key: String,
    pub operation: Operation,
    pub version: EventVersion,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl SilverUpsert {
    /// Identity mapping from a change event.
    #[must_use]
    pub fn from_event(event: ChangeEvent) -> Self {
        let version = event.version();
        let attributes = if event.operation.is_remove() {
            serde_json::Map::new()
        } else {
            event.attributes
        };
        Self {
            entity_type: event.entity_type,
            primary_key: event.primary_key,
            operation: event.operation,
            version,
            attributes,
        }
    }
}

/// Current state of one key in the canonical dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SilverRow {
    pub entity_type: EntityType,
    pub primary_key: String,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub last_event_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sequence_marker: Option<SequenceMarker>,
    pub last_event_id: String,
    pub last_operation: Operation,
    /// Tombstoned rows are retained so older events cannot resurrect them.
    pub deleted: bool,
    pub processed_at: DateTime<Utc>,
}

impl SilverRow {
    #[must_use]
    pub fn version(&self) -> EventVersion {
        EventVersion {
            timestamp: self.last_event_timestamp,
            sequence: self.last_sequence_marker.clone(),
            event_id: self.last_event_id.clone(),
        }
    }

    /// Attribute as a string, numbers rendered without quotes.
    #[must_use]
    pub fn text(&self, field: &str) -> Option<String> {
        match self.attributes.get(field)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Attribute as a float; numeric strings are accepted.
    #[must_use]
    pub fn number(&self, field: &str) -> Option<f64> {
        match self.attributes.get(field)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}
