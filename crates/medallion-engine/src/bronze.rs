//! Bronze ingestion of one source batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use medallion_lake::{BronzeLog, BronzeObjectRef};
use medallion_types::bronze::{BronzePosition, BronzeRecord};
use medallion_types::envelope::{DlqRecord, Timestamp};
use medallion_types::event::EntityType;

use crate::decode::EventDecoder;
use crate::errors::PipelineError;
use crate::source::SourceBatch;

const BATCH_ID_LEN: usize = 8;

/// What one batch produced. Quarantined payloads are returned, not
/// persisted, so the caller can attach them to its run.
#[derive(Debug, Default)]
pub struct IngestBatchOutcome {
    pub records_read: u64,
    pub records_written: u64,
    pub removes_dropped: u64,
    pub quarantined: Vec<DlqRecord>,
    pub objects: Vec<BronzeObjectRef>,
    /// Source position to commit once the outcome is accepted.
    pub next_position: u64,
}

/// Short random id distinguishing batches written in the same millisecond.
#[must_use]
pub fn new_batch_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..BATCH_ID_LEN].to_string()
}

/// Decodes raw changes and appends them to the bronze log, one immutable
/// object per entity of the batch.
pub struct BronzeIngestor {
    log: Arc<dyn BronzeLog>,
    decoder: Arc<dyn EventDecoder>,
    capture_removes: bool,
}

impl BronzeIngestor {
    pub fn new(log: Arc<dyn BronzeLog>, decoder: Arc<dyn EventDecoder>, capture_removes: bool) -> Self {
        Self {
            log,
            decoder,
            capture_removes,
        }
    }

    /// Write `batch` to bronze under an ingestion time of `now`.
    ///
    /// Undecodable payloads are quarantined and the rest of the batch
    /// continues. Every object is durable when this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns a transient stage error if an object can't be written. The
    /// source position must then stay uncommitted.
    pub fn ingest_batch(
        &self,
        batch: &SourceBatch,
        source_name: &str,
        now: DateTime<Utc>,
    ) -> Result<IngestBatchOutcome, PipelineError> {
        let position = BronzePosition::new(now, new_batch_id());
        let mut outcome = IngestBatchOutcome {
            next_position: batch.next_position,
            ..IngestBatchOutcome::default()
        };
        let mut by_entity: BTreeMap<EntityType, Vec<BronzeRecord>> = BTreeMap::new();

        for change in &batch.changes {
            outcome.records_read += 1;
            let decoded = match &change.rejected {
                Some(err) => Err(err.clone()),
                None => self.decoder.decode(&change.payload),
            };
            let event = match decoded {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(
                        source = source_name,
                        position = change.position,
                        code = %err.code,
                        "Quarantining undecodable change: {}",
                        err.message
                    );
                    outcome.quarantined.push(DlqRecord {
                        stream_name: source_name.to_string(),
                        record_json: change.payload.clone(),
                        error_message: err.message,
                        error_category: err.category,
                        failed_at: Timestamp::new(now.to_rfc3339()),
                    });
                    continue;
                }
            };
            if event.operation.is_remove() && !self.capture_removes {
                outcome.removes_dropped += 1;
                continue;
            }
            by_entity
                .entry(event.entity_type.clone())
                .or_default()
                .push(BronzeRecord {
                    event,
                    ingestion_timestamp: position.ingested_at,
                    batch_id: position.batch_id.clone(),
                });
        }

        for (entity, records) in &by_entity {
            let object = self.log.append(entity, &position, records)?;
            outcome.records_written += records.len() as u64;
            outcome.objects.push(object);
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{CanonicalDecoder, EntityCatalog};
    use crate::source::RawChange;
    use medallion_lake::FsBronzeLog;
    use medallion_types::error::{ErrorCategory, StageError};
    use serde_json::json;

    fn ingestor(root: &std::path::Path, capture_removes: bool) -> (BronzeIngestor, Arc<FsBronzeLog>) {
        let mut catalog = EntityCatalog::default();
        catalog.insert("orders", "orders", vec!["OrderID".into()]);
        catalog.insert("customers", "customers", vec!["CustomerID".into()]);
        let log = Arc::new(FsBronzeLog::new(root));
        let ingestor = BronzeIngestor::new(
            log.clone(),
            Arc::new(CanonicalDecoder::new(catalog)),
            capture_removes,
        );
        (ingestor, log)
    }

    fn change(position: u64, entity: &str, op: &str, key: &str) -> RawChange {
        RawChange::new(
            position,
            json!({
                "event_id": format!("e{position}"),
                "entity_type": entity,
                "operation": op,
                "event_timestamp": "2026-03-01T10:00:00Z",
                "primary_key": key,
            })
            .to_string(),
        )
    }

    fn now() -> DateTime<Utc> {
        "2026-03-01T10:00:05.123Z".parse().unwrap()
    }

    #[test]
    fn batch_is_split_into_one_object_per_entity() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, log) = ingestor(dir.path(), true);
        let batch = SourceBatch {
            changes: vec![
                change(0, "orders", "INSERT", "O1"),
                change(1, "customers", "INSERT", "C1"),
                change(2, "orders", "MODIFY", "O1"),
            ],
            next_position: 3,
        };

        let outcome = ingestor.ingest_batch(&batch, "stream", now()).unwrap();
        assert_eq!(outcome.records_read, 3);
        assert_eq!(outcome.records_written, 3);
        assert_eq!(outcome.objects.len(), 2);
        assert_eq!(outcome.next_position, 3);

        let orders = log
            .list_after(&EntityType::new("orders"), None, now())
            .unwrap();
        assert_eq!(orders.len(), 1);
        let records = log.read(&orders[0]).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.batch_id == orders[0].position.batch_id));
    }

    #[test]
    fn malformed_payloads_are_quarantined_and_batch_continues() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, _log) = ingestor(dir.path(), true);
        let batch = SourceBatch {
            changes: vec![
                RawChange::new(0, "{broken"),
                change(1, "invoices", "INSERT", "I1"),
                change(2, "orders", "INSERT", "O1"),
            ],
            next_position: 3,
        };

        let outcome = ingestor.ingest_batch(&batch, "stream", now()).unwrap();
        assert_eq!(outcome.records_written, 1);
        assert_eq!(outcome.quarantined.len(), 2);
        assert_eq!(outcome.quarantined[0].record_json, "{broken");
        assert_eq!(
            outcome.quarantined[1].error_category,
            ErrorCategory::MalformedEvent
        );
    }

    #[test]
    fn rejected_changes_are_quarantined_without_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, _log) = ingestor(dir.path(), true);
        let valid = change(1, "orders", "INSERT", "O1");
        let batch = SourceBatch {
            changes: vec![
                change(0, "orders", "INSERT", "O0"),
                RawChange::rejected(
                    1,
                    valid.payload,
                    StageError::malformed_event("INVALID_UTF8", "line 1 is not valid UTF-8"),
                ),
            ],
            next_position: 2,
        };

        let outcome = ingestor.ingest_batch(&batch, "stream", now()).unwrap();
        assert_eq!(outcome.records_read, 2);
        assert_eq!(outcome.records_written, 1);
        assert_eq!(outcome.quarantined.len(), 1);
        assert_eq!(
            outcome.quarantined[0].error_message,
            "line 1 is not valid UTF-8"
        );
        assert_eq!(outcome.next_position, 2);
    }

    #[test]
    fn removes_are_dropped_when_not_captured() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, _log) = ingestor(dir.path(), false);
        let batch = SourceBatch {
            changes: vec![
                change(0, "orders", "INSERT", "O1"),
                change(1, "orders", "REMOVE", "O1"),
            ],
            next_position: 2,
        };

        let outcome = ingestor.ingest_batch(&batch, "stream", now()).unwrap();
        assert_eq!(outcome.records_written, 1);
        assert_eq!(outcome.removes_dropped, 1);
    }

    #[test]
    fn empty_batch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, _log) = ingestor(dir.path(), true);
        let outcome = ingestor
            .ingest_batch(&SourceBatch::default(), "stream", now())
            .unwrap();
        assert!(outcome.objects.is_empty());
        assert!(!dir.path().join("bronze").exists());
    }

    #[test]
    fn batch_ids_are_short_and_distinct() {
        let a = new_batch_id();
        let b = new_batch_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }
}
