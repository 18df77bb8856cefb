//! Pipeline YAML configuration model.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    pub source: SourceConfig,
    pub entities: Vec<EntityConfig>,
    pub storage: StorageConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub bronze: BronzeConfig,
    #[serde(default)]
    pub silver: SilverConfig,
    #[serde(default)]
    pub gold: GoldConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
}

impl PipelineConfig {
    /// Entity configured under `name`.
    #[must_use]
    pub fn entity(&self, name: &str) -> Option<&EntityConfig> {
        self.entities.iter().find(|e| e.name == name)
    }
}

/// Wire format of the raw change stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// DynamoDB Streams records.
    #[default]
    Dynamodb,
    /// Change events already in canonical JSON form.
    Canonical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// JSON Lines file of raw changes, one per line.
    pub path: PathBuf,
    #[serde(default)]
    pub format: SourceFormat,
    /// Name the committed offset is stored under. Defaults to the file name.
    #[serde(default)]
    pub name: Option<String>,
}

impl SourceConfig {
    #[must_use]
    pub fn offset_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map_or_else(|| "source".to_string(), |n| n.to_string_lossy().into_owned())
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    /// Operational table feeding this entity. Defaults to `name`.
    #[serde(default)]
    pub source_table: Option<String>,
    /// Key attributes in composite-key order.
    pub primary_key: Vec<String>,
}

impl EntityConfig {
    #[must_use]
    pub fn table_name(&self) -> &str {
        self.source_table.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the bronze object tree.
    pub root: PathBuf,
    #[serde(default)]
    pub silver_path: Option<PathBuf>,
    #[serde(default)]
    pub gold_path: Option<PathBuf>,
}

impl StorageConfig {
    #[must_use]
    pub fn silver_db_path(&self) -> PathBuf {
        self.silver_path
            .clone()
            .unwrap_or_else(|| self.root.join("silver").join("silver.db"))
    }

    #[must_use]
    pub fn gold_db_path(&self) -> PathBuf {
        self.gold_path
            .clone()
            .unwrap_or_else(|| self.root.join("gold").join("gold.db"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    /// Database path. Defaults to `<storage.root>/state/state.db`.
    #[serde(default)]
    pub connection: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BronzeConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Keep REMOVE events so silver can tombstone deleted keys.
    #[serde(default = "default_true")]
    pub capture_removes: bool,
}

fn default_batch_size() -> usize {
    500
}
fn default_max_wait_ms() -> u64 {
    1_000
}
fn default_true() -> bool {
    true
}

impl Default for BronzeConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_wait_ms: default_max_wait_ms(),
            capture_removes: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilverConfig {
    /// Bronze objects younger than this are left for the next pass.
    #[serde(default = "default_settle_lag_secs")]
    pub settle_lag_secs: u64,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default)]
    pub enrichment: Vec<EnrichmentConfig>,
}

fn default_settle_lag_secs() -> u64 {
    10
}
fn default_lease_ttl_secs() -> u64 {
    300
}

impl Default for SilverConfig {
    fn default() -> Self {
        Self {
            settle_lag_secs: default_settle_lag_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            enrichment: Vec::new(),
        }
    }
}

/// Copy attributes from a canonical lookup entity into target rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Entity whose rows are enriched (e.g. `orders`).
    pub target: String,
    /// Entity the values come from (e.g. `customers`).
    pub lookup: String,
    /// Target attribute holding the lookup row's primary key.
    pub join_field: String,
    /// Lookup attribute -> target attribute.
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldConfig {
    #[serde(default = "default_hot_window_days")]
    pub hot_window_days: u32,
    #[serde(default = "default_orders_entity")]
    pub orders_entity: String,
    #[serde(default = "default_products_entity")]
    pub products_entity: String,
    #[serde(default)]
    pub fields: GoldFields,
    #[serde(default)]
    pub stock_thresholds: StockThresholds,
}

fn default_hot_window_days() -> u32 {
    30
}
fn default_orders_entity() -> String {
    "orders".to_string()
}
fn default_products_entity() -> String {
    "products".to_string()
}

impl Default for GoldConfig {
    fn default() -> Self {
        Self {
            hot_window_days: default_hot_window_days(),
            orders_entity: default_orders_entity(),
            products_entity: default_products_entity(),
            fields: GoldFields::default(),
            stock_thresholds: StockThresholds::default(),
        }
    }
}

/// Silver attribute names read by the aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoldFields {
    pub order_date: String,
    pub order_amount: String,
    pub customer_id: String,
    pub region: String,
    pub product_name: String,
    pub price: String,
    pub stock_level: String,
}

impl Default for GoldFields {
    fn default() -> Self {
        Self {
            order_date: "OrderDate".to_string(),
            order_amount: "TotalAmount".to_string(),
            customer_id: "CustomerID".to_string(),
            region: "customer_region".to_string(),
            product_name: "Name".to_string(),
            price: "Price".to_string(),
            stock_level: "StockLevel".to_string(),
        }
    }
}

/// Stock below `critical` is Critical, below `low` is Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StockThresholds {
    pub critical: i64,
    pub low: i64,
}

impl Default for StockThresholds {
    fn default() -> Self {
        Self {
            critical: 10,
            low: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Retries of a stage run after a transient failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Wall-clock budget of one stage run.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    900
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}
