//! Raw change decoding: DynamoDB Streams records and canonical JSON.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use medallion_types::error::StageError;
use medallion_types::event::{ChangeEvent, EntityType, Operation, SequenceMarker};

use crate::config::types::{PipelineConfig, SourceFormat};

/// Key separator of composite primary keys.
pub const COMPOSITE_KEY_SEPARATOR: char = '#';

#[derive(Debug, Clone, PartialEq, Eq)]
struct CatalogEntry {
    entity: EntityType,
    key_fields: Vec<String>,
}

/// Source table to entity mapping built from the pipeline entities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityCatalog {
    by_table: HashMap<String, CatalogEntry>,
    entities: HashMap<String, Vec<String>>,
}

impl EntityCatalog {
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut catalog = Self::default();
        for entity in &config.entities {
            catalog.insert(entity.table_name(), &entity.name, entity.primary_key.clone());
        }
        catalog
    }

    pub fn insert(&mut self, table: &str, entity: &str, key_fields: Vec<String>) {
        self.entities.insert(entity.to_string(), key_fields.clone());
        self.by_table.insert(
            table.to_string(),
            CatalogEntry {
                entity: EntityType::new(entity),
                key_fields,
            },
        );
    }

    fn table(&self, table: &str) -> Option<&CatalogEntry> {
        self.by_table.get(table)
    }

    #[must_use]
    pub fn contains_entity(&self, entity: &EntityType) -> bool {
        self.entities.contains_key(entity.as_str())
    }
}

/// Turns one raw payload into a [`ChangeEvent`].
pub trait EventDecoder: Send + Sync {
    /// # Errors
    ///
    /// Returns a `malformed_event` error when the payload can't be
    /// interpreted. The caller quarantines it.
    fn decode(&self, payload: &str) -> Result<ChangeEvent, StageError>;
}

/// Decoder for the configured wire format.
#[must_use]
pub fn decoder_for(config: &PipelineConfig) -> Box<dyn EventDecoder> {
    let catalog = EntityCatalog::from_config(config);
    match config.source.format {
        SourceFormat::Dynamodb => Box::new(DynamoDbDecoder::new(catalog)),
        SourceFormat::Canonical => Box::new(CanonicalDecoder::new(catalog)),
    }
}

fn malformed(code: &str, message: impl Into<String>) -> StageError {
    StageError::malformed_event(code, message)
}

// ---------------------------------------------------------------------------
// DynamoDB Streams
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StreamRecord {
    #[serde(rename = "eventID")]
    event_id: String,
    #[serde(rename = "eventName")]
    event_name: String,
    #[serde(rename = "eventSourceARN")]
    event_source_arn: String,
    dynamodb: StreamData,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StreamData {
    approximate_creation_date_time: Option<f64>,
    #[serde(default)]
    keys: Map<String, Value>,
    new_image: Option<Map<String, Value>>,
    sequence_number: Option<String>,
}

/// Decodes DynamoDB Streams records (one JSON object per payload).
pub struct DynamoDbDecoder {
    catalog: EntityCatalog,
}

impl DynamoDbDecoder {
    #[must_use]
    pub fn new(catalog: EntityCatalog) -> Self {
        Self { catalog }
    }
}

/// `arn:aws:dynamodb:<region>:<account>:table/<Name>/stream/<label>`
fn table_from_arn(arn: &str) -> Option<&str> {
    arn.split('/').nth(1).filter(|name| !name.is_empty())
}

#[allow(clippy::cast_possible_truncation)]
fn timestamp_from_epoch_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
}

fn number_value(raw: &str) -> Result<Value, String> {
    if let Ok(int) = raw.parse::<i64>() {
        return Ok(Value::from(int));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| format!("invalid number '{raw}'"))
}

fn string_list(raw: &Value, tag: &str) -> Result<Vec<String>, String> {
    raw.as_array()
        .ok_or_else(|| format!("{tag} must be a list"))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("{tag} members must be strings"))
        })
        .collect()
}

/// Flatten one typed attribute value (`{"S": "x"}`, `{"N": "1"}`, ...).
fn attribute_value(typed: &Value) -> Result<Value, String> {
    let obj = typed
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| "attribute must be a single-key type descriptor".to_string())?;
    let Some((tag, raw)) = obj.iter().next() else {
        return Err("empty attribute descriptor".to_string());
    };
    match tag.as_str() {
        "S" | "B" => raw
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(|| format!("{tag} must be a string")),
        "N" => raw
            .as_str()
            .ok_or_else(|| "N must be a string".to_string())
            .and_then(number_value),
        "BOOL" => raw
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| "BOOL must be a boolean".to_string()),
        "NULL" => Ok(Value::Null),
        "L" => raw
            .as_array()
            .ok_or_else(|| "L must be a list".to_string())?
            .iter()
            .map(attribute_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        "M" => raw
            .as_object()
            .ok_or_else(|| "M must be a map".to_string())
            .and_then(flatten_item)
            .map(Value::Object),
        "SS" | "BS" => Ok(Value::from(string_list(raw, tag)?)),
        "NS" => string_list(raw, tag)?
            .iter()
            .map(String::as_str)
            .map(number_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Err(format!("unsupported attribute type '{other}'")),
    }
}

fn flatten_item(item: &Map<String, Value>) -> Result<Map<String, Value>, String> {
    item.iter()
        .map(|(name, typed)| {
            attribute_value(typed)
                .map(|v| (name.clone(), v))
                .map_err(|e| format!("attribute '{name}': {e}"))
        })
        .collect()
}

fn key_component(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl EventDecoder for DynamoDbDecoder {
    fn decode(&self, payload: &str) -> Result<ChangeEvent, StageError> {
        let record: StreamRecord = serde_json::from_str(payload)
            .map_err(|e| malformed("INVALID_RECORD", format!("not a stream record: {e}")))?;

        let operation = Operation::parse(&record.event_name).ok_or_else(|| {
            malformed(
                "UNKNOWN_OPERATION",
                format!("unknown eventName '{}'", record.event_name),
            )
        })?;
        let table = table_from_arn(&record.event_source_arn).ok_or_else(|| {
            malformed(
                "INVALID_ARN",
                format!("no table in eventSourceARN '{}'", record.event_source_arn),
            )
        })?;
        let entry = self.catalog.table(table).ok_or_else(|| {
            malformed("UNKNOWN_TABLE", format!("table '{table}' is not mapped to an entity"))
        })?;

        let data = record.dynamodb;
        let event_timestamp = data
            .approximate_creation_date_time
            .and_then(timestamp_from_epoch_secs)
            .ok_or_else(|| {
                malformed(
                    "MISSING_TIMESTAMP",
                    "ApproximateCreationDateTime is missing or invalid",
                )
            })?;

        let keys = flatten_item(&data.keys).map_err(|e| malformed("INVALID_KEYS", e))?;
        let mut components = Vec::with_capacity(entry.key_fields.len());
        for field in &entry.key_fields {
            let component = keys.get(field).and_then(key_component).ok_or_else(|| {
                malformed("MISSING_KEY", format!("key attribute '{field}' missing or empty"))
            })?;
            components.push(component);
        }

        let attributes = if operation.is_remove() {
            Map::new()
        } else {
            let image = data.new_image.ok_or_else(|| {
                malformed(
                    "MISSING_IMAGE",
                    format!("{operation} record without NewImage"),
                )
            })?;
            flatten_item(&image).map_err(|e| malformed("INVALID_IMAGE", e))?
        };

        Ok(ChangeEvent {
            event_id: record.event_id,
            entity_type: entry.entity.clone(),
            operation,
            event_timestamp,
            primary_key: components.join(&COMPOSITE_KEY_SEPARATOR.to_string()),
            attributes,
            sequence_marker: data.sequence_number.map(SequenceMarker::new),
        })
    }
}

// ---------------------------------------------------------------------------
// Canonical
// ---------------------------------------------------------------------------

/// Decodes payloads that already are serialized [`ChangeEvent`]s.
pub struct CanonicalDecoder {
    catalog: EntityCatalog,
}

impl CanonicalDecoder {
    #[must_use]
    pub fn new(catalog: EntityCatalog) -> Self {
        Self { catalog }
    }
}

impl EventDecoder for CanonicalDecoder {
    fn decode(&self, payload: &str) -> Result<ChangeEvent, StageError> {
        let event: ChangeEvent = serde_json::from_str(payload)
            .map_err(|e| malformed("INVALID_EVENT", format!("not a change event: {e}")))?;
        if !self.catalog.contains_entity(&event.entity_type) {
            return Err(malformed(
                "UNKNOWN_ENTITY",
                format!("entity '{}' is not configured", event.entity_type),
            ));
        }
        if event.primary_key.is_empty() || event.event_id.is_empty() {
            return Err(malformed(
                "MISSING_KEY",
                "event_id and primary_key must not be empty",
            ));
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medallion_types::error::ErrorCategory;
    use serde_json::json;

    fn catalog() -> EntityCatalog {
        let mut catalog = EntityCatalog::default();
        catalog.insert("Orders", "orders", vec!["OrderID".into()]);
        catalog.insert("OrderLines", "order_lines", vec!["OrderID".into(), "Line".into()]);
        catalog
    }

    fn stream_record(name: &str, table: &str, image: Option<Value>) -> String {
        let mut dynamodb = json!({
            "ApproximateCreationDateTime": 1_767_225_600.25,
            "Keys": {"OrderID": {"S": "O1"}},
            "SequenceNumber": "4900000000000000000000000123",
        });
        if let Some(image) = image {
            dynamodb["NewImage"] = image;
        }
        json!({
            "eventID": "evt-1",
            "eventName": name,
            "eventSourceARN": format!("arn:aws:dynamodb:eu-west-1:1234:table/{table}/stream/2026-01-01T00:00:00.000"),
            "dynamodb": dynamodb,
        })
        .to_string()
    }

    #[test]
    fn decodes_insert_with_typed_attributes() {
        let image = json!({
            "OrderID": {"S": "O1"},
            "TotalAmount": {"N": "100.5"},
            "Quantity": {"N": "3"},
            "Paid": {"BOOL": true},
            "Note": {"NULL": true},
            "Tags": {"SS": ["a", "b"]},
            "Lines": {"L": [{"M": {"Sku": {"S": "X"}, "Qty": {"N": "2"}}}]},
        });
        let event = DynamoDbDecoder::new(catalog())
            .decode(&stream_record("INSERT", "Orders", Some(image)))
            .unwrap();

        assert_eq!(event.entity_type.as_str(), "orders");
        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.primary_key, "O1");
        assert_eq!(event.event_timestamp.timestamp_subsec_millis(), 250);
        assert_eq!(
            event.sequence_marker.as_ref().map(SequenceMarker::as_str),
            Some("4900000000000000000000000123")
        );
        assert_eq!(event.attributes["TotalAmount"], json!(100.5));
        assert_eq!(event.attributes["Quantity"], json!(3));
        assert_eq!(event.attributes["Paid"], json!(true));
        assert_eq!(event.attributes["Note"], Value::Null);
        assert_eq!(event.attributes["Tags"], json!(["a", "b"]));
        assert_eq!(event.attributes["Lines"], json!([{"Sku": "X", "Qty": 2}]));
    }

    #[test]
    fn remove_carries_no_attributes() {
        let event = DynamoDbDecoder::new(catalog())
            .decode(&stream_record("REMOVE", "Orders", None))
            .unwrap();
        assert_eq!(event.operation, Operation::Remove);
        assert!(event.attributes.is_empty());
    }

    #[test]
    fn composite_keys_join_in_configured_order() {
        let payload = json!({
            "eventID": "evt-2",
            "eventName": "MODIFY",
            "eventSourceARN": "arn:aws:dynamodb:eu-west-1:1234:table/OrderLines/stream/x",
            "dynamodb": {
                "ApproximateCreationDateTime": 1_767_225_600,
                "Keys": {"Line": {"N": "2"}, "OrderID": {"S": "O1"}},
                "NewImage": {"Sku": {"S": "X"}},
            },
        })
        .to_string();
        let event = DynamoDbDecoder::new(catalog()).decode(&payload).unwrap();
        assert_eq!(event.primary_key, "O1#2");
        assert!(event.sequence_marker.is_none());
    }

    #[test]
    fn unmapped_table_is_malformed() {
        let err = DynamoDbDecoder::new(catalog())
            .decode(&stream_record("INSERT", "Invoices", Some(json!({}))))
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::MalformedEvent);
        assert_eq!(err.code, "UNKNOWN_TABLE");
    }

    #[test]
    fn insert_without_image_is_malformed() {
        let err = DynamoDbDecoder::new(catalog())
            .decode(&stream_record("INSERT", "Orders", None))
            .unwrap_err();
        assert_eq!(err.code, "MISSING_IMAGE");
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let err = DynamoDbDecoder::new(catalog()).decode("{not json").unwrap_err();
        assert_eq!(err.code, "INVALID_RECORD");
        assert!(!err.retryable);
    }

    #[test]
    fn unsupported_attribute_type_is_malformed() {
        let image = json!({"Blob": {"XYZ": "1"}});
        let err = DynamoDbDecoder::new(catalog())
            .decode(&stream_record("INSERT", "Orders", Some(image)))
            .unwrap_err();
        assert_eq!(err.code, "INVALID_IMAGE");
        assert!(err.message.contains("Blob"));
    }

    #[test]
    fn canonical_decoder_accepts_known_entity() {
        let payload = json!({
            "event_id": "e1",
            "entity_type": "orders",
            "operation": "MODIFY",
            "event_timestamp": "2026-01-01T00:00:10Z",
            "primary_key": "O1",
            "attributes": {"TotalAmount": 5},
        })
        .to_string();
        let event = CanonicalDecoder::new(catalog()).decode(&payload).unwrap();
        assert_eq!(event.operation, Operation::Modify);
        assert_eq!(event.attributes["TotalAmount"], json!(5));
    }

    #[test]
    fn canonical_decoder_rejects_unknown_entity() {
        let payload = json!({
            "event_id": "e1",
            "entity_type": "invoices",
            "operation": "INSERT",
            "event_timestamp": "2026-01-01T00:00:10Z",
            "primary_key": "I1",
        })
        .to_string();
        let err = CanonicalDecoder::new(catalog()).decode(&payload).unwrap_err();
        assert_eq!(err.code, "UNKNOWN_ENTITY");
    }
}
