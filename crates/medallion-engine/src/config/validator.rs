//! Semantic validation for parsed pipeline configuration values.

use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::config::types::{EnrichmentConfig, PipelineConfig};

/// Entity and attribute names become directory names and JSON paths.
fn validate_identifier(value: &str, context: &str, errors: &mut Vec<String>) {
    if value.trim().is_empty() {
        errors.push(format!("{context} must not be empty"));
        return;
    }
    if value.contains(['/', '\\']) || value.starts_with('.') {
        errors.push(format!(
            "{context} '{value}' must not contain path separators or start with '.'"
        ));
    }
}

fn validate_enrichment(
    rule: &EnrichmentConfig,
    index: usize,
    entity_names: &HashSet<&str>,
    errors: &mut Vec<String>,
) {
    let context = format!("silver.enrichment[{index}]");
    if !entity_names.contains(rule.target.as_str()) {
        errors.push(format!("{context}: unknown target entity '{}'", rule.target));
    }
    if !entity_names.contains(rule.lookup.as_str()) {
        errors.push(format!("{context}: unknown lookup entity '{}'", rule.lookup));
    }
    if rule.target == rule.lookup {
        errors.push(format!("{context}: target and lookup must differ"));
    }
    if rule.join_field.trim().is_empty() {
        errors.push(format!("{context}: join_field must not be empty"));
    }
    if rule.fields.is_empty() {
        errors.push(format!("{context}: fields must map at least one attribute"));
    }
}

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if config.source.path.as_os_str().is_empty() {
        errors.push("source.path must not be empty".to_string());
    }

    if config.entities.is_empty() {
        errors.push("At least one entity must be defined".to_string());
    }

    let mut entity_names = HashSet::new();
    let mut table_names = HashSet::new();
    for (i, entity) in config.entities.iter().enumerate() {
        validate_identifier(&entity.name, &format!("entities[{i}].name"), &mut errors);
        if !entity_names.insert(entity.name.as_str()) {
            errors.push(format!("Entity '{}' is defined more than once", entity.name));
        }
        if !table_names.insert(entity.table_name()) {
            errors.push(format!(
                "Source table '{}' is mapped to more than one entity",
                entity.table_name()
            ));
        }
        if entity.primary_key.is_empty() {
            errors.push(format!(
                "Entity '{}' must declare at least one primary_key field",
                entity.name
            ));
        }
    }

    if config.bronze.batch_size == 0 {
        errors.push("bronze.batch_size must be at least 1".to_string());
    }

    if config.silver.lease_ttl_secs == 0 {
        errors.push("silver.lease_ttl_secs must be > 0".to_string());
    }

    let mut targets = HashSet::new();
    for (i, rule) in config.silver.enrichment.iter().enumerate() {
        validate_enrichment(rule, i, &entity_names, &mut errors);
        targets.insert(rule.target.as_str());
    }
    for rule in &config.silver.enrichment {
        if targets.contains(rule.lookup.as_str()) {
            errors.push(format!(
                "Entity '{}' is both an enrichment target and a lookup",
                rule.lookup
            ));
        }
    }

    if config.gold.hot_window_days == 0 {
        errors.push("gold.hot_window_days must be > 0".to_string());
    }
    if !entity_names.contains(config.gold.orders_entity.as_str()) {
        errors.push(format!(
            "gold.orders_entity '{}' is not a configured entity",
            config.gold.orders_entity
        ));
    }
    if !entity_names.contains(config.gold.products_entity.as_str()) {
        errors.push(format!(
            "gold.products_entity '{}' is not a configured entity",
            config.gold.products_entity
        ));
    }
    let thresholds = config.gold.stock_thresholds;
    if thresholds.critical > thresholds.low {
        errors.push(format!(
            "gold.stock_thresholds.critical ({}) must not exceed low ({})",
            thresholds.critical, thresholds.low
        ));
    }

    if config.resources.timeout_secs == 0 {
        errors.push("resources.timeout_secs must be > 0".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_pipeline_str;

    fn valid_yaml() -> &'static str {
        r#"
version: "1.0"
pipeline: test_pipeline
source:
  path: /data/stream.jsonl
entities:
  - name: customers
    source_table: Customers
    primary_key: [CustomerID]
  - name: orders
    source_table: Orders
    primary_key: [OrderID]
  - name: products
    source_table: Products
    primary_key: [ProductID]
storage:
  root: /data/lake
silver:
  enrichment:
    - target: orders
      lookup: customers
      join_field: CustomerID
      fields:
        Region: customer_region
"#
    }

    #[test]
    fn test_valid_pipeline_passes() {
        let config = parse_pipeline_str(valid_yaml()).unwrap();
        assert!(validate_pipeline(&config).is_ok());
    }

    #[test]
    fn test_wrong_version_fails() {
        let yaml = valid_yaml().replace("\"1.0\"", "\"2.0\"");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("Unsupported pipeline version"));
    }

    #[test]
    fn test_empty_pipeline_name_fails() {
        let yaml = valid_yaml().replace("test_pipeline", "\"\"");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("Pipeline name must not be empty"));
    }

    #[test]
    fn test_missing_primary_key_fails() {
        let yaml = valid_yaml().replace("primary_key: [OrderID]", "primary_key: []");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("'orders' must declare at least one primary_key"));
    }

    #[test]
    fn test_duplicate_table_mapping_fails() {
        let yaml = valid_yaml().replace("source_table: Products", "source_table: Orders");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("'Orders' is mapped to more than one entity"));
    }

    #[test]
    fn test_entity_name_with_separator_fails() {
        let yaml = valid_yaml().replace("name: products", "name: ../products");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("path separators"));
    }

    #[test]
    fn test_unknown_enrichment_lookup_fails() {
        let yaml = valid_yaml().replace("lookup: customers", "lookup: vendors");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("unknown lookup entity 'vendors'"));
    }

    #[test]
    fn test_unknown_gold_entity_fails() {
        let yaml = format!("{}gold:\n  orders_entity: sales\n", valid_yaml());
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("gold.orders_entity 'sales'"));
    }

    #[test]
    fn test_inverted_stock_thresholds_fail() {
        let yaml = format!(
            "{}gold:\n  stock_thresholds:\n    critical: 60\n    low: 50\n",
            valid_yaml()
        );
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("must not exceed low"));
    }

    #[test]
    fn test_multiple_errors_reported() {
        let yaml = valid_yaml()
            .replace("\"1.0\"", "\"2.0\"")
            .replace("test_pipeline", "\"\"");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("Unsupported pipeline version"));
        assert!(err.contains("Pipeline name must not be empty"));
    }
}
