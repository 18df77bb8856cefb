//! Dead-letter persistence for quarantined source payloads.

use medallion_state::StateBackend;
use medallion_types::envelope::DlqRecord;
use medallion_types::state::PipelineId;

/// Persist quarantined records against `run_id`. Failures are logged and
/// never fail the batch: the payloads are already excluded from bronze.
pub(crate) fn persist_dlq_records(
    state_backend: &dyn StateBackend,
    pipeline: &PipelineId,
    run_id: i64,
    records: &[DlqRecord],
) -> u64 {
    if records.is_empty() {
        return 0;
    }

    match state_backend.insert_dlq_records(pipeline, run_id, records) {
        Ok(inserted) => {
            tracing::info!(
                pipeline = pipeline.as_str(),
                run_id,
                dlq_records = inserted,
                "Quarantined records persisted"
            );
            inserted
        }
        Err(e) => {
            tracing::error!(
                pipeline = pipeline.as_str(),
                run_id,
                dlq_count = records.len(),
                error = %e,
                "Failed to persist quarantined records"
            );
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medallion_state::SqliteStateBackend;
    use medallion_types::envelope::Timestamp;
    use medallion_types::error::ErrorCategory;
    use medallion_types::state::Stage;

    fn record(payload: &str) -> DlqRecord {
        DlqRecord {
            stream_name: "stream.jsonl".into(),
            record_json: payload.into(),
            error_message: "not json".into(),
            error_category: ErrorCategory::MalformedEvent,
            failed_at: Timestamp::new("2026-03-01T00:00:00Z"),
        }
    }

    #[test]
    fn empty_batch_writes_nothing() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let pid = PipelineId::new("p");
        assert_eq!(persist_dlq_records(&backend, &pid, 1, &[]), 0);
        assert!(backend.list_dlq_records(&pid, 10).unwrap().is_empty());
    }

    #[test]
    fn records_are_listed_after_persist() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let pid = PipelineId::new("p");
        let run_id = backend.start_run(&pid, Stage::Bronze).unwrap();
        let inserted =
            persist_dlq_records(&backend, &pid, run_id, &[record("{oops"), record("???")]);
        assert_eq!(inserted, 2);
        assert_eq!(backend.list_dlq_records(&pid, 10).unwrap().len(), 2);
    }
}
