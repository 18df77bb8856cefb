//! Record transformers: winning change events to canonical silver upserts.

use std::collections::HashMap;

use medallion_lake::SilverStore;
use medallion_types::error::StageError;
use medallion_types::event::{ChangeEvent, EntityType};
use medallion_types::silver::{SilverRow, SilverUpsert};
use serde_json::{Map, Value};

use crate::config::types::EnrichmentConfig;
use crate::errors::PipelineError;

/// Pure mapping from the winners of one entity to canonical upserts.
pub trait RecordTransformer: Send + Sync {
    /// # Errors
    ///
    /// Returns a stage error that aborts the entity's pass.
    fn transform(
        &self,
        entity: &EntityType,
        winners: Vec<ChangeEvent>,
    ) -> Result<Vec<SilverUpsert>, StageError>;
}

/// Passes attributes through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

impl RecordTransformer for IdentityTransformer {
    fn transform(
        &self,
        _entity: &EntityType,
        winners: Vec<ChangeEvent>,
    ) -> Result<Vec<SilverUpsert>, StageError> {
        Ok(winners.into_iter().map(SilverUpsert::from_event).collect())
    }
}

/// One enrichment join against a snapshot of a lookup entity.
#[derive(Debug, Clone)]
struct Enrichment {
    join_field: String,
    /// Lookup attribute -> target attribute.
    fields: Vec<(String, String)>,
    lookup: HashMap<String, Map<String, Value>>,
}

impl Enrichment {
    fn apply(&self, attributes: &mut Map<String, Value>) {
        let matched = attributes
            .get(&self.join_field)
            .and_then(join_key)
            .and_then(|key| self.lookup.get(&key));
        let Some(source) = matched else {
            return;
        };
        for (from, to) in &self.fields {
            if let Some(value) = source.get(from) {
                attributes.insert(to.clone(), value.clone());
            }
        }
    }
}

fn join_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Adds attributes of canonical lookup rows (e.g. customer region) to the
/// rows of target entities. Targets without a matching lookup row keep
/// their attributes as they are. Removes pass through untouched.
#[derive(Debug, Clone, Default)]
pub struct EnrichingTransformer {
    rules: HashMap<EntityType, Vec<Enrichment>>,
}

impl EnrichingTransformer {
    /// Build from `rules` and the rows of every lookup entity. Tombstoned
    /// lookup rows never match.
    #[must_use]
    pub fn from_snapshot(
        rules: &[EnrichmentConfig],
        snapshots: &HashMap<EntityType, Vec<SilverRow>>,
    ) -> Self {
        let mut transformer = Self::default();
        for rule in rules {
            let lookup = snapshots
                .get(&EntityType::new(rule.lookup.as_str()))
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .filter(|row| !row.deleted)
                .map(|row| (row.primary_key.clone(), row.attributes.clone()))
                .collect();
            transformer
                .rules
                .entry(EntityType::new(rule.target.as_str()))
                .or_default()
                .push(Enrichment {
                    join_field: rule.join_field.clone(),
                    fields: rule
                        .fields
                        .iter()
                        .map(|(from, to)| (from.clone(), to.clone()))
                        .collect(),
                    lookup,
                });
        }
        transformer
    }

    #[must_use]
    pub fn enriches(&self, entity: &EntityType) -> bool {
        self.rules.contains_key(entity)
    }
}

impl RecordTransformer for EnrichingTransformer {
    fn transform(
        &self,
        entity: &EntityType,
        winners: Vec<ChangeEvent>,
    ) -> Result<Vec<SilverUpsert>, StageError> {
        let rules = self.rules.get(entity).map_or(&[][..], Vec::as_slice);
        Ok(winners
            .into_iter()
            .map(|event| {
                let mut upsert = SilverUpsert::from_event(event);
                if !upsert.operation.is_remove() {
                    for rule in rules {
                        rule.apply(&mut upsert.attributes);
                    }
                }
                upsert
            })
            .collect())
    }
}

/// Snapshot the lookup entities of `rules` from silver and build the
/// transformer for the enrichment targets.
///
/// # Errors
///
/// Returns a storage error if a lookup entity can't be scanned.
pub fn build_transformer(
    rules: &[EnrichmentConfig],
    silver: &dyn SilverStore,
) -> Result<EnrichingTransformer, PipelineError> {
    let mut snapshots: HashMap<EntityType, Vec<SilverRow>> = HashMap::new();
    for rule in rules {
        let entity = EntityType::new(rule.lookup.as_str());
        if !snapshots.contains_key(&entity) {
            let rows = silver.scan(&entity)?;
            tracing::debug!(
                lookup = entity.as_str(),
                rows = rows.len(),
                "Loaded enrichment snapshot"
            );
            snapshots.insert(entity, rows);
        }
    }
    Ok(EnrichingTransformer::from_snapshot(rules, &snapshots))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use medallion_lake::SqliteSilverStore;
    use medallion_types::event::Operation;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn event(entity: &str, key: &str, op: Operation, attrs: Value) -> ChangeEvent {
        ChangeEvent {
            event_id: format!("{entity}-{key}"),
            entity_type: EntityType::new(entity),
            operation: op,
            event_timestamp: ts(100),
            primary_key: key.to_string(),
            attributes: attrs.as_object().cloned().unwrap_or_default(),
            sequence_marker: None,
        }
    }

    fn customer_rule() -> EnrichmentConfig {
        EnrichmentConfig {
            target: "orders".into(),
            lookup: "customers".into(),
            join_field: "CustomerID".into(),
            fields: BTreeMap::from([
                ("Name".to_string(), "customer_name".to_string()),
                ("Region".to_string(), "customer_region".to_string()),
            ]),
        }
    }

    fn silver_with_customers() -> SqliteSilverStore {
        let store = SqliteSilverStore::in_memory().unwrap();
        let customers = EntityType::new("customers");
        let upserts: Vec<SilverUpsert> = [
            event("customers", "C1", Operation::Insert, json!({"Name": "Ada", "Region": "EU"})),
            event("customers", "C2", Operation::Insert, json!({"Name": "Bo", "Region": "US"})),
        ]
        .into_iter()
        .map(SilverUpsert::from_event)
        .collect();
        store.merge(&customers, &upserts).unwrap();
        store
    }

    #[test]
    fn identity_keeps_attributes() {
        let out = IdentityTransformer
            .transform(
                &EntityType::new("orders"),
                vec![event("orders", "O1", Operation::Insert, json!({"TotalAmount": 5}))],
            )
            .unwrap();
        assert_eq!(out[0].attributes["TotalAmount"], json!(5));
    }

    #[test]
    fn orders_are_enriched_from_customer_snapshot() {
        let silver = silver_with_customers();
        let transformer = build_transformer(&[customer_rule()], &silver).unwrap();
        assert!(transformer.enriches(&EntityType::new("orders")));

        let out = transformer
            .transform(
                &EntityType::new("orders"),
                vec![
                    event("orders", "O1", Operation::Insert, json!({"CustomerID": "C1"})),
                    event("orders", "O2", Operation::Insert, json!({"CustomerID": "C9"})),
                ],
            )
            .unwrap();

        assert_eq!(out[0].attributes["customer_region"], json!("EU"));
        assert_eq!(out[0].attributes["customer_name"], json!("Ada"));
        assert!(!out[1].attributes.contains_key("customer_region"));
    }

    #[test]
    fn removes_and_other_entities_pass_through() {
        let silver = silver_with_customers();
        let transformer = build_transformer(&[customer_rule()], &silver).unwrap();

        let removed = transformer
            .transform(
                &EntityType::new("orders"),
                vec![event("orders", "O1", Operation::Remove, json!({"CustomerID": "C1"}))],
            )
            .unwrap();
        assert!(removed[0].attributes.is_empty());

        let products = transformer
            .transform(
                &EntityType::new("products"),
                vec![event("products", "P1", Operation::Insert, json!({"CustomerID": "C1"}))],
            )
            .unwrap();
        assert!(!products[0].attributes.contains_key("customer_region"));
    }

    #[test]
    fn numeric_join_keys_match_string_primary_keys() {
        let store = SqliteSilverStore::in_memory().unwrap();
        store
            .merge(
                &EntityType::new("customers"),
                &[SilverUpsert::from_event(event(
                    "customers",
                    "42",
                    Operation::Insert,
                    json!({"Region": "APAC"}),
                ))],
            )
            .unwrap();
        let transformer = build_transformer(&[customer_rule()], &store).unwrap();
        let out = transformer
            .transform(
                &EntityType::new("orders"),
                vec![event("orders", "O1", Operation::Insert, json!({"CustomerID": 42}))],
            )
            .unwrap();
        assert_eq!(out[0].attributes["customer_region"], json!("APAC"));
    }
}
