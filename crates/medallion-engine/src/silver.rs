//! Silver reconciliation: bronze objects past the watermark are reduced
//! to one winning version per key and merged into the canonical store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use medallion_lake::{BronzeLog, MergeSummary, SilverStore};
use medallion_state::StateBackend;
use medallion_types::bronze::{BronzePosition, BronzeRecord};
use medallion_types::error::StageError;
use medallion_types::event::{ChangeEvent, EntityType, EventVersion};
use medallion_types::state::{PipelineId, StateKey};
use tokio::task::JoinSet;

use crate::checkpoint::advance_watermarks;
use crate::config::types::EnrichmentConfig;
use crate::errors::PipelineError;
use crate::execution::StageBudget;
use crate::transform::{build_transformer, IdentityTransformer, RecordTransformer};

/// Result of reconciling one entity. Nothing is committed to the state
/// backend yet; `new_position` is what its watermark should advance to.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityPassOutcome {
    pub entity: EntityType,
    pub objects_read: u64,
    pub records_read: u64,
    pub winners: u64,
    pub summary: MergeSummary,
    /// Watermark the pass started from.
    pub previous: Option<String>,
    pub new_position: Option<BronzePosition>,
}

impl EntityPassOutcome {
    fn empty(entity: EntityType, previous: Option<String>) -> Self {
        Self {
            entity,
            objects_read: 0,
            records_read: 0,
            winners: 0,
            summary: MergeSummary::default(),
            previous,
            new_position: None,
        }
    }
}

/// Keep the greatest version of every key, ordered by key.
///
/// Duplicated deliveries of one event are harmless. The same `event_id`
/// carrying two different versions (or keys) means upstream rewrote an
/// immutable event and fails the pass.
///
/// # Errors
///
/// Returns a `MergeInvariant` error on a mutated event or a record that
/// belongs to another entity.
pub fn select_winners(
    entity: &EntityType,
    records: Vec<BronzeRecord>,
) -> Result<Vec<ChangeEvent>, StageError> {
    let mut seen: HashMap<String, (String, EventVersion)> = HashMap::new();
    let mut winners: BTreeMap<String, ChangeEvent> = BTreeMap::new();

    for record in records {
        let event = record.event;
        if event.entity_type != *entity {
            return Err(StageError::merge_invariant(
                "ENTITY_MISMATCH",
                format!(
                    "event {} of '{}' found in bronze objects of '{entity}'",
                    event.event_id, event.entity_type
                ),
            ));
        }

        let version = event.version();
        if let Some((key, known)) = seen.get(&event.event_id) {
            if *known != version || *key != event.primary_key {
                return Err(StageError::merge_invariant(
                    "EVENT_MUTATED",
                    format!("event {} delivered with two different versions", event.event_id),
                )
                .with_details(serde_json::json!({
                    "entity": entity.as_str(),
                    "event_id": event.event_id,
                    "primary_key": event.primary_key,
                })));
            }
            continue;
        }
        seen.insert(
            event.event_id.clone(),
            (event.primary_key.clone(), version.clone()),
        );

        match winners.get(&event.primary_key) {
            Some(current) if current.version() >= version => {}
            _ => {
                winners.insert(event.primary_key.clone(), event);
            }
        }
    }

    Ok(winners.into_values().collect())
}

/// Reads bronze and merges into silver for one entity at a time.
pub struct SilverReconciler {
    bronze: Arc<dyn BronzeLog>,
    silver: Arc<dyn SilverStore>,
}

impl SilverReconciler {
    pub fn new(bronze: Arc<dyn BronzeLog>, silver: Arc<dyn SilverStore>) -> Self {
        Self { bronze, silver }
    }

    #[must_use]
    pub fn silver(&self) -> &Arc<dyn SilverStore> {
        &self.silver
    }

    /// Merge every settled bronze object of `entity` after `watermark`.
    ///
    /// Blocking; run it on the blocking pool.
    ///
    /// # Errors
    ///
    /// Storage errors, a corrupt watermark, merge invariant violations, or
    /// `Timeout` if the budget is spent before the merge commits.
    pub fn reconcile_entity(
        &self,
        entity: &EntityType,
        watermark: Option<String>,
        upper: DateTime<Utc>,
        transformer: &dyn RecordTransformer,
        budget: &StageBudget,
    ) -> Result<EntityPassOutcome, PipelineError> {
        let after = watermark
            .as_deref()
            .map(|raw| {
                BronzePosition::parse_key(raw).ok_or_else(|| {
                    PipelineError::Infrastructure(anyhow::anyhow!(
                        "corrupt watermark for '{entity}': '{raw}'"
                    ))
                })
            })
            .transpose()?;

        let objects = self.bronze.list_after(entity, after.as_ref(), upper)?;
        let Some(last) = objects.last() else {
            tracing::debug!(entity = entity.as_str(), "No settled bronze objects");
            return Ok(EntityPassOutcome::empty(entity.clone(), watermark));
        };
        let new_position = last.position.clone();

        let mut records = Vec::new();
        for object in &objects {
            records.extend(self.bronze.read(object)?);
        }
        let records_read = records.len() as u64;

        let winners = select_winners(entity, records)?;
        let winner_count = winners.len() as u64;
        let upserts = transformer.transform(entity, winners)?;

        budget.check("silver merge")?;
        let summary = self.silver.merge(entity, &upserts)?;

        tracing::info!(
            entity = entity.as_str(),
            objects = objects.len(),
            records_read,
            winners = winner_count,
            inserted = summary.inserted,
            updated = summary.updated,
            tombstoned = summary.tombstoned,
            skipped_stale = summary.skipped_stale,
            "Entity reconciled"
        );

        Ok(EntityPassOutcome {
            entity: entity.clone(),
            objects_read: objects.len() as u64,
            records_read,
            winners: winner_count,
            summary,
            previous: watermark,
            new_position: Some(new_position),
        })
    }
}

/// Collect per-entity tasks, failing fast on the first error.
async fn collect_entity_results(
    mut join_set: JoinSet<Result<EntityPassOutcome, PipelineError>>,
) -> Result<Vec<EntityPassOutcome>, PipelineError> {
    let mut successes = Vec::new();
    let mut first_error: Option<PipelineError> = None;

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(outcome)) if first_error.is_none() => successes.push(outcome),
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                tracing::error!("Entity reconciliation failed: {}", error);
                if first_error.is_none() {
                    first_error = Some(error);
                    join_set.abort_all();
                }
            }
            Err(join_err) if join_err.is_cancelled() && first_error.is_some() => {
                // Expected: siblings cancelled after the first failure.
            }
            Err(join_err) => return Err(PipelineError::task_failed("reconcile", &join_err)),
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(successes),
    }
}

/// One reconciliation pass over a set of entities, holding their leases.
pub struct ReconcilePass {
    pub reconciler: Arc<SilverReconciler>,
    pub state: Arc<dyn StateBackend>,
    pub pipeline: PipelineId,
    pub holder: String,
    pub lease_ttl: Duration,
    pub enrichment: Vec<EnrichmentConfig>,
}

impl ReconcilePass {
    /// Reconcile `entities` with bronze settled up to `upper`, then advance
    /// their watermarks. Leases are released however the pass ends, unless
    /// the future is dropped, in which case they expire with their TTL.
    ///
    /// # Errors
    ///
    /// `WatermarkConflict` if another holder owns a lease, otherwise the
    /// first entity or commit failure.
    pub async fn run(
        &self,
        entities: &[EntityType],
        upper: DateTime<Utc>,
        budget: &StageBudget,
    ) -> Result<Vec<EntityPassOutcome>, PipelineError> {
        let held = self.acquire_leases(entities).await?;
        let result = self.run_leased(entities, upper, budget).await;
        self.release_leases(held).await;
        result
    }

    async fn acquire_leases(&self, entities: &[EntityType]) -> Result<Vec<StateKey>, PipelineError> {
        let state = self.state.clone();
        let pipeline = self.pipeline.clone();
        let holder = self.holder.clone();
        let ttl = self.lease_ttl;
        let keys: Vec<StateKey> = entities.iter().map(StateKey::silver).collect();

        let (held, outcome) = tokio::task::spawn_blocking(move || {
            let mut held = Vec::new();
            for key in keys {
                match state.try_acquire_lease(&pipeline, &key, &holder, ttl) {
                    Ok(true) => held.push(key),
                    Ok(false) => {
                        let err = StageError::watermark_conflict(
                            "LEASE_HELD",
                            format!("another reconciler holds the lease on '{key}'"),
                        );
                        return (held, Err(PipelineError::Stage(err)));
                    }
                    Err(e) => return (held, Err(PipelineError::from(e))),
                }
            }
            (held, Ok(()))
        })
        .await
        .map_err(|e| PipelineError::task_failed("acquire_leases", &e))?;

        if let Err(err) = outcome {
            self.release_leases(held).await;
            return Err(err);
        }
        Ok(held)
    }

    async fn release_leases(&self, keys: Vec<StateKey>) {
        if keys.is_empty() {
            return;
        }
        let state = self.state.clone();
        let pipeline = self.pipeline.clone();
        let holder = self.holder.clone();
        let released = tokio::task::spawn_blocking(move || {
            for key in &keys {
                if let Err(e) = state.release_lease(&pipeline, key, &holder) {
                    // The TTL reclaims it.
                    tracing::warn!(key = key.as_str(), error = %e, "Failed to release lease");
                }
            }
        })
        .await;
        if let Err(e) = released {
            tracing::error!("release_leases task panicked: {e}");
        }
    }

    async fn read_watermarks(
        &self,
        entities: &[EntityType],
    ) -> Result<HashMap<EntityType, Option<String>>, PipelineError> {
        let state = self.state.clone();
        let pipeline = self.pipeline.clone();
        let entities = entities.to_vec();
        tokio::task::spawn_blocking(move || {
            entities
                .into_iter()
                .map(|entity| -> Result<(EntityType, Option<String>), PipelineError> {
                    let watermark = state
                        .get_watermark(&pipeline, &StateKey::silver(&entity))?
                        .map(|w| w.value);
                    Ok((entity, watermark))
                })
                .collect::<Result<HashMap<_, _>, PipelineError>>()
        })
        .await
        .map_err(|e| PipelineError::task_failed("read_watermarks", &e))?
    }

    async fn run_phase(
        &self,
        entities: Vec<EntityType>,
        watermarks: &HashMap<EntityType, Option<String>>,
        upper: DateTime<Utc>,
        transformer: Arc<dyn RecordTransformer>,
        budget: &StageBudget,
    ) -> Result<Vec<EntityPassOutcome>, PipelineError> {
        let mut join_set = JoinSet::new();
        for entity in entities {
            let reconciler = self.reconciler.clone();
            let watermark = watermarks.get(&entity).cloned().flatten();
            let transformer = transformer.clone();
            let budget = budget.clone();
            join_set.spawn_blocking(move || {
                reconciler.reconcile_entity(&entity, watermark, upper, transformer.as_ref(), &budget)
            });
        }
        collect_entity_results(join_set).await
    }

    async fn run_leased(
        &self,
        entities: &[EntityType],
        upper: DateTime<Utc>,
        budget: &StageBudget,
    ) -> Result<Vec<EntityPassOutcome>, PipelineError> {
        let watermarks = self.read_watermarks(entities).await?;

        // Lookup entities settle before the targets that read them.
        let (targets, plain): (Vec<EntityType>, Vec<EntityType>) =
            entities.iter().cloned().partition(|entity| {
                self.enrichment
                    .iter()
                    .any(|rule| rule.target == entity.as_str())
            });

        let mut outcomes = self
            .run_phase(plain, &watermarks, upper, Arc::new(IdentityTransformer), budget)
            .await?;

        if !targets.is_empty() {
            let silver = self.reconciler.silver().clone();
            let rules = self.enrichment.clone();
            let transformer = tokio::task::spawn_blocking(move || {
                build_transformer(&rules, silver.as_ref())
            })
            .await
            .map_err(|e| PipelineError::task_failed("build_transformer", &e))??;
            outcomes.extend(
                self.run_phase(targets, &watermarks, upper, Arc::new(transformer), budget)
                    .await?,
            );
        }

        budget.check("watermark commit")?;
        let state = self.state.clone();
        let pipeline = self.pipeline.clone();
        let to_commit = outcomes.clone();
        let advanced = tokio::task::spawn_blocking(move || {
            advance_watermarks(state.as_ref(), &pipeline, &to_commit)
        })
        .await
        .map_err(|e| PipelineError::task_failed("advance_watermarks", &e))??;
        if advanced > 0 {
            tracing::info!(
                pipeline = self.pipeline.as_str(),
                watermarks_advanced = advanced,
                "Silver watermarks advanced"
            );
        }

        outcomes.sort_by(|a, b| a.entity.cmp(&b.entity));
        Ok(outcomes)
    }
}
