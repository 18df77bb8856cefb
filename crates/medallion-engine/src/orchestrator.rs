//! Pipeline orchestrator: opens the stores, runs the bronze, silver and gold
//! stages under retry and time budgets, and records every run.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use medallion_lake::{BronzeLog, FsBronzeLog, GoldStore, SilverStore, SqliteGoldStore, SqliteSilverStore};
use medallion_state::{SqliteStateBackend, StateBackend};
use medallion_types::error::StageError;
use medallion_types::event::EntityType;
use medallion_types::state::{PipelineId, RunStats, RunStatus, Stage, StateKey};

use crate::bronze::{BronzeIngestor, IngestBatchOutcome};
use crate::config::types::{PipelineConfig, StateBackendKind};
use crate::config::validate_pipeline;
use crate::decode::decoder_for;
use crate::errors::{compute_backoff, PipelineError};
use crate::execution::{AggregateOptions, IngestOptions, ReconcileOptions, StageBudget};
use crate::gold::GoldAggregator;
use crate::result::{
    AggregateResult, CheckResult, EntityReconcileResult, EntityStatus, IngestResult,
    PipelineStatus, ReconcileResult,
};
use crate::silver::{ReconcilePass, SilverReconciler};
use crate::source::{ChangeSource, JsonlChangeSource};

const STATUS_DLQ_LIMIT: usize = 20;

type SharedSource = Arc<Mutex<Box<dyn ChangeSource>>>;

/// Default state database under the storage root.
fn default_state_path(config: &PipelineConfig) -> PathBuf {
    config.storage.root.join("state").join("state.db")
}

pub(crate) fn create_state_backend(config: &PipelineConfig) -> Result<Arc<dyn StateBackend>> {
    match config.state.backend {
        StateBackendKind::Sqlite => {
            let path = config
                .state
                .connection
                .clone()
                .unwrap_or_else(|| default_state_path(config));
            let backend = SqliteStateBackend::open(&path)
                .with_context(|| format!("Failed to open state DB at {}", path.display()))?;
            Ok(Arc::new(backend) as Arc<dyn StateBackend>)
        }
    }
}

/// Change source described by the pipeline's `source` section.
#[must_use]
pub fn open_source(config: &PipelineConfig) -> Box<dyn ChangeSource> {
    Box::new(JsonlChangeSource::new(
        config.source.offset_name(),
        config.source.path.clone(),
    ))
}

/// A configured pipeline bound to its state backend and layer stores.
pub struct Pipeline {
    config: PipelineConfig,
    pipeline_id: PipelineId,
    state: Arc<dyn StateBackend>,
    bronze: Arc<dyn BronzeLog>,
    silver: Arc<dyn SilverStore>,
    gold: Arc<dyn GoldStore>,
}

impl Pipeline {
    /// Open the stores named by `config`, creating them on first use.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if a store can't be opened.
    pub fn open(config: PipelineConfig) -> Result<Self, PipelineError> {
        let state = create_state_backend(&config)?;
        let bronze = Arc::new(FsBronzeLog::new(config.storage.root.clone()));
        let silver_path = config.storage.silver_db_path();
        let silver = SqliteSilverStore::open(&silver_path)
            .with_context(|| format!("Failed to open silver store at {}", silver_path.display()))?;
        let gold_path = config.storage.gold_db_path();
        let gold = SqliteGoldStore::open(&gold_path)
            .with_context(|| format!("Failed to open gold store at {}", gold_path.display()))?;
        Ok(Self::with_backends(
            config,
            state,
            bronze,
            Arc::new(silver),
            Arc::new(gold),
        ))
    }

    #[must_use]
    pub fn with_backends(
        config: PipelineConfig,
        state: Arc<dyn StateBackend>,
        bronze: Arc<dyn BronzeLog>,
        silver: Arc<dyn SilverStore>,
        gold: Arc<dyn GoldStore>,
    ) -> Self {
        let pipeline_id = PipelineId::new(config.pipeline.clone());
        Self {
            config,
            pipeline_id,
            state,
            bronze,
            silver,
            gold,
        }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn pipeline_id(&self) -> &PipelineId {
        &self.pipeline_id
    }

    #[must_use]
    pub fn state(&self) -> &Arc<dyn StateBackend> {
        &self.state
    }

    #[must_use]
    pub fn silver(&self) -> &Arc<dyn SilverStore> {
        &self.silver
    }

    #[must_use]
    pub fn gold(&self) -> &Arc<dyn GoldStore> {
        &self.gold
    }

    fn stage_budget(&self) -> StageBudget {
        StageBudget::new(Duration::from_secs(self.config.resources.timeout_secs))
    }

    // -----------------------------------------------------------------------
    // Bronze
    // -----------------------------------------------------------------------

    /// Move raw changes from `source` into bronze, committing the source
    /// offset after each durable batch.
    ///
    /// # Errors
    ///
    /// Returns the first failure that survives the retry policy.
    pub async fn ingest(
        &self,
        source: Box<dyn ChangeSource>,
        options: IngestOptions,
    ) -> Result<IngestResult, PipelineError> {
        let start = Instant::now();
        let source_name = source.name().to_string();
        tracing::info!(
            pipeline = self.config.pipeline,
            source = source_name,
            max_batches = options.max_batches,
            "Starting bronze ingest"
        );

        let run_id = self.start_run(Stage::Bronze).await?;
        let budget = self.stage_budget();
        let ingestor = Arc::new(BronzeIngestor::new(
            self.bronze.clone(),
            Arc::from(decoder_for(&self.config)),
            self.config.bronze.capture_removes,
        ));
        let source: SharedSource = Arc::new(Mutex::new(source));

        let mut result = IngestResult::default();
        let outcome = self
            .within_budget(
                &budget,
                Stage::Bronze,
                self.ingest_batches(&source, &ingestor, &source_name, run_id, &options, &budget, &mut result),
            )
            .await;
        result.duration_secs = start.elapsed().as_secs_f64();

        let stats = RunStats {
            records_read: result.records_read,
            records_written: result.records_written,
            records_quarantined: result.records_quarantined,
            error_message: None,
        };
        self.finish_run(run_id, Stage::Bronze, outcome, stats).await?;

        tracing::info!(
            pipeline = self.config.pipeline,
            batches = result.batches,
            records_read = result.records_read,
            records_written = result.records_written,
            records_quarantined = result.records_quarantined,
            committed_position = result.committed_position,
            duration_secs = result.duration_secs,
            "Bronze ingest completed"
        );
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn ingest_batches(
        &self,
        source: &SharedSource,
        ingestor: &Arc<BronzeIngestor>,
        source_name: &str,
        run_id: i64,
        options: &IngestOptions,
        budget: &StageBudget,
        result: &mut IngestResult,
    ) -> Result<(), PipelineError> {
        let offset_key = StateKey::source(source_name);
        let mut committed = self.read_source_offset(&offset_key).await?;
        let mut last_ingested: Option<DateTime<Utc>> = None;
        let mut first = true;

        loop {
            if options.max_batches.is_some_and(|max| result.batches >= max) {
                break;
            }

            // Positions of one process strictly increase even when the clock
            // is pinned or stalls within a millisecond.
            let clock = options.now.unwrap_or_else(Utc::now);
            let now = match last_ingested {
                Some(last) if clock <= last => last + TimeDelta::milliseconds(1),
                _ => clock,
            };

            let step = BatchStep {
                source: source.clone(),
                ingestor: ingestor.clone(),
                state: self.state.clone(),
                pipeline: self.pipeline_id.clone(),
                offset_key: offset_key.clone(),
                source_name: source_name.to_string(),
                committed,
                max_records: self.config.bronze.batch_size,
                max_wait: Duration::from_millis(self.config.bronze.max_wait_ms),
                now,
                budget: budget.clone(),
            };
            let reposition = first;
            let (outcome, retries) = self
                .with_retries(Stage::Bronze, |attempt| {
                    let step = step.clone();
                    let reposition = reposition || attempt > 1;
                    async move { step.run(reposition).await }
                })
                .await?;
            first = false;
            result.retry_count += retries;

            let Some(outcome) = outcome else {
                tracing::debug!(source = source_name, "Source drained");
                break;
            };
            last_ingested = Some(now);
            committed = Some(outcome.next_position);

            result.batches += 1;
            result.records_read += outcome.records_read;
            result.records_written += outcome.records_written;
            result.removes_dropped += outcome.removes_dropped;
            result.records_quarantined += outcome.quarantined.len() as u64;
            result.objects_written += outcome.objects.len() as u64;
            result.committed_position = committed;

            tracing::debug!(
                source = source_name,
                records_read = outcome.records_read,
                records_written = outcome.records_written,
                quarantined = outcome.quarantined.len(),
                position = outcome.next_position,
                "Bronze batch committed"
            );

            if !outcome.quarantined.is_empty() {
                let state = self.state.clone();
                let pipeline = self.pipeline_id.clone();
                let records = outcome.quarantined;
                tokio::task::spawn_blocking(move || {
                    crate::dlq::persist_dlq_records(state.as_ref(), &pipeline, run_id, &records)
                })
                .await
                .map_err(|e| PipelineError::task_failed("persist_dlq_records", &e))?;
            }
        }
        Ok(())
    }

    async fn read_source_offset(&self, key: &StateKey) -> Result<Option<u64>, PipelineError> {
        let state = self.state.clone();
        let pipeline = self.pipeline_id.clone();
        let key = key.clone();
        let stored = tokio::task::spawn_blocking(move || state.get_watermark(&pipeline, &key))
            .await
            .map_err(|e| PipelineError::task_failed("read_source_offset", &e))??;
        stored
            .map(|w| {
                w.value.parse::<u64>().map_err(|e| {
                    PipelineError::Infrastructure(anyhow::anyhow!(
                        "corrupt source offset '{}': {e}",
                        w.value
                    ))
                })
            })
            .transpose()
    }

    // -----------------------------------------------------------------------
    // Silver
    // -----------------------------------------------------------------------

    /// Reconcile settled bronze objects into silver and advance watermarks.
    ///
    /// # Errors
    ///
    /// `WatermarkConflict` when another reconciler holds a lease, otherwise
    /// the first failure that survives the retry policy.
    pub async fn reconcile(
        &self,
        options: ReconcileOptions,
    ) -> Result<ReconcileResult, PipelineError> {
        let start = Instant::now();
        let entities = self.select_entities(&options.entities)?;
        let now = options.now.unwrap_or_else(Utc::now);
        let settle_lag = TimeDelta::from_std(Duration::from_secs(self.config.silver.settle_lag_secs))
            .map_err(|e| StageError::config("INVALID_SETTLE_LAG", e.to_string()))?;
        let upper = now.checked_sub_signed(settle_lag).unwrap_or(DateTime::<Utc>::MIN_UTC);

        tracing::info!(
            pipeline = self.config.pipeline,
            entities = entities.len(),
            upper = %upper,
            "Starting silver reconcile"
        );

        let pass = ReconcilePass {
            reconciler: Arc::new(SilverReconciler::new(self.bronze.clone(), self.silver.clone())),
            state: self.state.clone(),
            pipeline: self.pipeline_id.clone(),
            holder: lease_holder(),
            lease_ttl: Duration::from_secs(self.config.silver.lease_ttl_secs),
            enrichment: self.config.silver.enrichment.clone(),
        };

        let run_id = self.start_run(Stage::Silver).await?;
        let budget = self.stage_budget();
        let (pass_ref, entities_ref, budget_ref) = (&pass, entities.as_slice(), &budget);
        // A timed-out pass may still own leases through detached blocking
        // tasks; those leases lapse with their TTL.
        let outcome = self
            .within_budget(
                &budget,
                Stage::Silver,
                self.with_retries(Stage::Silver, move |_| {
                    pass_ref.run(entities_ref, upper, budget_ref)
                }),
            )
            .await;

        let mut result = ReconcileResult {
            duration_secs: start.elapsed().as_secs_f64(),
            ..ReconcileResult::default()
        };
        let outcome = outcome.map(|(outcomes, retries)| {
            result.entities = outcomes.iter().map(EntityReconcileResult::from).collect();
            result.retry_count = retries;
        });
        let stats = RunStats {
            records_read: result.records_read(),
            records_written: result.rows_applied(),
            records_quarantined: 0,
            error_message: None,
        };
        self.finish_run(run_id, Stage::Silver, outcome, stats).await?;

        tracing::info!(
            pipeline = self.config.pipeline,
            entities = result.entities.len(),
            records_read = result.records_read(),
            rows_applied = result.rows_applied(),
            duration_secs = result.duration_secs,
            "Silver reconcile completed"
        );
        Ok(result)
    }

    fn select_entities(&self, requested: &[String]) -> Result<Vec<EntityType>, PipelineError> {
        if requested.is_empty() {
            return Ok(self
                .config
                .entities
                .iter()
                .map(|e| EntityType::new(e.name.as_str()))
                .collect());
        }
        let mut selected: Vec<EntityType> = Vec::with_capacity(requested.len());
        for name in requested {
            if self.config.entity(name).is_none() {
                return Err(StageError::config(
                    "UNKNOWN_ENTITY",
                    format!("entity '{name}' is not configured"),
                )
                .into());
            }
            let entity = EntityType::new(name.as_str());
            if !selected.contains(&entity) {
                selected.push(entity);
            }
        }
        Ok(selected)
    }

    // -----------------------------------------------------------------------
    // Gold
    // -----------------------------------------------------------------------

    /// Recompute gold from silver and publish it.
    ///
    /// # Errors
    ///
    /// Returns the first failure that survives the retry policy.
    pub async fn aggregate(
        &self,
        options: AggregateOptions,
    ) -> Result<AggregateResult, PipelineError> {
        let start = Instant::now();
        let today = options.today.unwrap_or_else(|| Utc::now().date_naive());
        let mode = options.mode;
        tracing::info!(
            pipeline = self.config.pipeline,
            mode = ?mode,
            today = %today,
            "Starting gold refresh"
        );

        let aggregator = Arc::new(GoldAggregator::new(
            self.silver.clone(),
            self.gold.clone(),
            self.config.gold.clone(),
        ));
        let run_id = self.start_run(Stage::Gold).await?;
        let budget = self.stage_budget();
        let budget_ref = &budget;
        let outcome = self
            .within_budget(
                &budget,
                Stage::Gold,
                self.with_retries(Stage::Gold, |_| {
                    let aggregator = aggregator.clone();
                    let budget = budget_ref.clone();
                    async move {
                        tokio::task::spawn_blocking(move || aggregator.refresh(mode, today, &budget))
                            .await
                            .map_err(|e| PipelineError::task_failed("gold refresh", &e))?
                    }
                }),
            )
            .await;

        let duration_secs = start.elapsed().as_secs_f64();
        let stats = match &outcome {
            Ok((refresh, _)) => RunStats {
                records_read: refresh.orders_read,
                records_written: refresh.summary.daily_sales_written
                    + refresh.summary.products_written
                    + refresh.summary.metrics_written,
                records_quarantined: 0,
                error_message: None,
            },
            Err(_) => RunStats::default(),
        };
        let (refresh, retry_count) = self.finish_run(run_id, Stage::Gold, outcome, stats).await?;

        Ok(AggregateResult {
            full_refresh: refresh.full_refresh,
            window_start: refresh.window_start,
            orders_read: refresh.orders_read,
            skipped_orders: refresh.skipped_orders,
            daily_sales_written: refresh.summary.daily_sales_written,
            daily_sales_replaced: refresh.summary.daily_sales_replaced,
            products_written: refresh.summary.products_written,
            metrics_written: refresh.summary.metrics_written,
            duration_secs,
            retry_count,
        })
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Watermarks, silver row counts, the gold cold frontier and recent
    /// quarantined records.
    ///
    /// # Errors
    ///
    /// Returns a storage error if any store can't be read.
    pub async fn status(&self) -> Result<PipelineStatus, PipelineError> {
        let state = self.state.clone();
        let silver = self.silver.clone();
        let gold = self.gold.clone();
        let pipeline = self.pipeline_id.clone();
        let entities: Vec<EntityType> = self
            .config
            .entities
            .iter()
            .map(|e| EntityType::new(e.name.as_str()))
            .collect();

        tokio::task::spawn_blocking(move || -> Result<PipelineStatus, PipelineError> {
            let watermarks = state.list_watermarks(&pipeline)?;
            let recent_dlq = state.list_dlq_records(&pipeline, STATUS_DLQ_LIMIT)?;
            let entities = entities
                .into_iter()
                .map(|entity| -> Result<EntityStatus, PipelineError> {
                    Ok(EntityStatus {
                        counts: silver.counts(&entity)?,
                        entity: entity.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, PipelineError>>()?;
            Ok(PipelineStatus {
                watermarks,
                entities,
                cold_frontier: gold.cold_frontier()?,
                recent_dlq,
            })
        })
        .await
        .map_err(|e| PipelineError::task_failed("status", &e))?
    }

    // -----------------------------------------------------------------------
    // Shared stage machinery
    // -----------------------------------------------------------------------

    /// Run `attempt_fn` until it succeeds, fails permanently or exhausts
    /// `resources.max_retries`. Returns the value and the retries used.
    async fn with_retries<T, F, Fut>(
        &self,
        stage: Stage,
        mut attempt_fn: F,
    ) -> Result<(T, u32), PipelineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let max_retries = self.config.resources.max_retries;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match attempt_fn(attempt).await {
                Ok(value) => return Ok((value, attempt - 1)),
                Err(ref err) if err.is_retryable() && attempt <= max_retries => {
                    if let Some(stage_err) = err.as_stage_error() {
                        let delay = compute_backoff(stage_err, attempt);
                        #[allow(clippy::cast_possible_truncation)]
                        // Safety: delay is capped well under u64::MAX millis
                        let delay_ms = delay.as_millis() as u64;
                        tracing::warn!(
                            stage = %stage,
                            attempt,
                            max_retries,
                            delay_ms,
                            category = %stage_err.category,
                            code = %stage_err.code,
                            "Retryable error, will retry: {}",
                            stage_err.message
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => {
                    log_stage_failure(stage, attempt, max_retries, &err);
                    return Err(err);
                }
            }
        }
    }

    /// Bound `fut` by the stage budget. On expiry the budget is cancelled so
    /// blocking work still in flight commits nothing further.
    async fn within_budget<T>(
        &self,
        budget: &StageBudget,
        stage: Stage,
        fut: impl Future<Output = Result<T, PipelineError>>,
    ) -> Result<T, PipelineError> {
        if let Ok(result) = tokio::time::timeout(budget.timeout(), fut).await {
            return result;
        }
        budget.cancel();
        tracing::error!(
            pipeline = self.config.pipeline,
            stage = %stage,
            timeout_secs = budget.timeout().as_secs(),
            "Stage timed out, aborting without further commits"
        );
        Err(budget.exceeded(&format!("{stage} completion")).into())
    }

    async fn start_run(&self, stage: Stage) -> Result<i64, PipelineError> {
        let state = self.state.clone();
        let pipeline = self.pipeline_id.clone();
        tokio::task::spawn_blocking(move || state.start_run(&pipeline, stage))
            .await
            .map_err(|e| PipelineError::task_failed("start_run", &e))?
            .map_err(PipelineError::from)
    }

    /// Record the run's terminal status. A stage failure wins over a
    /// failure to record it.
    async fn finish_run<T>(
        &self,
        run_id: i64,
        stage: Stage,
        outcome: Result<T, PipelineError>,
        mut stats: RunStats,
    ) -> Result<T, PipelineError> {
        let status = match &outcome {
            Ok(_) => RunStatus::Completed,
            Err(err) => {
                stats.error_message = Some(format!("{stage} error: {err}"));
                RunStatus::Failed
            }
        };
        let state = self.state.clone();
        let recorded = tokio::task::spawn_blocking(move || state.complete_run(run_id, status, &stats))
            .await
            .map_err(|e| PipelineError::task_failed("complete_run", &e))
            .and_then(|r| r.map_err(PipelineError::from));

        match (outcome, recorded) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(record_err)) => {
                tracing::error!(run_id, error = %record_err, "Failed to record failed run");
                Err(err)
            }
        }
    }
}

fn log_stage_failure(stage: Stage, attempt: u32, max_retries: u32, err: &PipelineError) {
    let Some(stage_err) = err.as_stage_error() else {
        tracing::error!(stage = %stage, "Infrastructure error, failing stage: {}", err);
        return;
    };
    if stage_err.requires_alert() {
        tracing::error!(
            stage = %stage,
            alert = true,
            category = %stage_err.category,
            code = %stage_err.code,
            details = ?stage_err.details,
            "Merge invariant violated, failing stage: {}",
            stage_err.message
        );
    } else if stage_err.retryable {
        tracing::error!(
            stage = %stage,
            attempt,
            max_retries,
            category = %stage_err.category,
            code = %stage_err.code,
            "Max retries exhausted, failing stage: {}",
            stage_err.message
        );
    } else {
        tracing::error!(
            stage = %stage,
            category = %stage_err.category,
            code = %stage_err.code,
            "Non-retryable stage error, failing stage: {}",
            stage_err.message
        );
    }
}

/// Lease holder id of this process's pass.
fn lease_holder() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", std::process::id(), &suffix[..8])
}

/// Everything one bronze batch needs on the blocking pool.
#[derive(Clone)]
struct BatchStep {
    source: SharedSource,
    ingestor: Arc<BronzeIngestor>,
    state: Arc<dyn StateBackend>,
    pipeline: PipelineId,
    offset_key: StateKey,
    source_name: String,
    committed: Option<u64>,
    max_records: usize,
    max_wait: Duration,
    now: DateTime<Utc>,
    budget: StageBudget,
}

impl BatchStep {
    async fn run(self, reposition: bool) -> Result<Option<IngestBatchOutcome>, PipelineError> {
        tokio::task::spawn_blocking(move || self.execute(reposition))
            .await
            .map_err(|e| PipelineError::task_failed("bronze batch", &e))?
    }

    /// Poll, write to bronze, then commit the source offset. Returns `None`
    /// once the source has nothing more.
    fn execute(&self, reposition: bool) -> Result<Option<IngestBatchOutcome>, PipelineError> {
        let batch = {
            let mut source = self.source.lock().map_err(|_| {
                PipelineError::Infrastructure(anyhow::anyhow!("change source lock poisoned"))
            })?;
            if reposition {
                source.seek(self.committed.unwrap_or(0))?;
            }
            source.poll_batch(self.max_records, self.max_wait)?
        };
        if batch.is_empty() {
            return Ok(None);
        }

        let outcome = self.ingestor.ingest_batch(&batch, &self.source_name, self.now)?;

        self.budget.check("source offset commit")?;
        let expected = self.committed.map(|p| p.to_string());
        let swapped = self.state.compare_and_set(
            &self.pipeline,
            &self.offset_key,
            expected.as_deref(),
            &outcome.next_position.to_string(),
        )?;
        if !swapped {
            return Err(StageError::watermark_conflict(
                "OFFSET_MOVED",
                format!("source offset '{}' changed during ingest", self.offset_key),
            )
            .into());
        }
        Ok(Some(outcome))
    }
}

// ---------------------------------------------------------------------------
// Check
// ---------------------------------------------------------------------------

fn check_component(name: &str, outcome: Result<()>, problems: &mut Vec<String>) -> bool {
    match outcome {
        Ok(()) => {
            tracing::info!("{name}: OK");
            true
        }
        Err(e) => {
            tracing::error!("{name}: FAILED: {e:#}");
            problems.push(format!("{name}: {e:#}"));
            false
        }
    }
}

fn check_source(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("source {} is not readable", path.display()))?;
    if !meta.is_file() {
        anyhow::bail!("source {} is not a file", path.display());
    }
    Ok(())
}

/// Validate the configuration and confirm every store can be opened.
#[must_use]
pub fn check_pipeline(config: &PipelineConfig) -> CheckResult {
    tracing::info!(pipeline = config.pipeline, "Checking pipeline configuration");
    let mut problems = Vec::new();

    let config_ok = check_component("Config", validate_pipeline(config), &mut problems);
    let source_ok = check_component("Source", check_source(&config.source.path), &mut problems);
    let state_ok = check_component(
        "State backend",
        create_state_backend(config).map(|_| ()),
        &mut problems,
    );
    let bronze_root = config.storage.root.join("bronze");
    let bronze_ok = check_component(
        "Bronze log",
        std::fs::create_dir_all(&bronze_root)
            .with_context(|| format!("cannot create {}", bronze_root.display())),
        &mut problems,
    );
    let silver_ok = check_component(
        "Silver store",
        SqliteSilverStore::open(&config.storage.silver_db_path())
            .map(|_| ())
            .context("cannot open silver store"),
        &mut problems,
    );
    let gold_ok = check_component(
        "Gold store",
        SqliteGoldStore::open(&config.storage.gold_db_path())
            .map(|_| ())
            .context("cannot open gold store"),
        &mut problems,
    );

    CheckResult {
        config_ok,
        source_ok,
        state_ok,
        bronze_ok,
        silver_ok,
        gold_ok,
        problems,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_pipeline_str;

    fn config(root: &Path, source: &Path) -> PipelineConfig {
        parse_pipeline_str(&format!(
            r#"
version: "1.0"
pipeline: orchestrator_test
source:
  path: {}
  format: canonical
entities:
  - name: orders
    primary_key: [OrderID]
  - name: customers
    primary_key: [CustomerID]
  - name: products
    primary_key: [ProductID]
storage:
  root: {}
"#,
            source.display(),
            root.display()
        ))
        .unwrap()
    }

    #[test]
    fn state_db_defaults_under_storage_root() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &dir.path().join("stream.jsonl"));
        assert_eq!(
            default_state_path(&cfg),
            dir.path().join("state").join("state.db")
        );
        create_state_backend(&cfg).unwrap();
        assert!(dir.path().join("state").join("state.db").exists());
    }

    #[test]
    fn unknown_entity_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline =
            Pipeline::open(config(dir.path(), &dir.path().join("stream.jsonl"))).unwrap();
        let err = pipeline
            .select_entities(&["shipments".to_string()])
            .unwrap_err();
        assert_eq!(
            err.as_stage_error().map(|e| e.code.as_str()),
            Some("UNKNOWN_ENTITY")
        );
        let all = pipeline.select_entities(&[]).unwrap();
        assert_eq!(all.len(), 3);
        let one = pipeline
            .select_entities(&["orders".to_string(), "orders".to_string()])
            .unwrap();
        assert_eq!(one, vec![EntityType::new("orders")]);
    }

    #[test]
    fn check_reports_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let result = check_pipeline(&config(dir.path(), &dir.path().join("missing.jsonl")));
        assert!(result.config_ok);
        assert!(!result.source_ok);
        assert!(result.state_ok && result.silver_ok && result.gold_ok && result.bronze_ok);
        assert!(!result.all_ok());
        assert_eq!(result.problems.len(), 1);
    }

    #[test]
    fn check_passes_with_existing_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("stream.jsonl");
        std::fs::write(&source, "").unwrap();
        assert!(check_pipeline(&config(dir.path(), &source)).all_ok());
    }

    #[test]
    fn lease_holders_are_unique() {
        assert_ne!(lease_holder(), lease_holder());
    }
}
