//! Gold-layer aggregate rows.
//!
//! Every gold row is derived from silver and can be recomputed at any
//! time; none of them is authoritative on its own.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Daily revenue per customer region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySalesRow {
    pub order_date: NaiveDate,
    pub region: String,
    pub order_count: u64,
    pub total_revenue: f64,
    pub avg_order_value: f64,
    pub unique_customers: u64,
    pub computed_at: DateTime<Utc>,
}

/// Revenue of one order date across all regions. Kept so look-back
/// metrics can use cold days without reading silver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRevenueRow {
    pub order_date: NaiveDate,
    pub order_count: u64,
    pub total_revenue: f64,
    pub computed_at: DateTime<Utc>,
}

/// Stock classification for a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StockStatus {
    Critical,
    Low,
    Good,
}

impl StockStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "Critical",
            Self::Low => "Low",
            Self::Good => "Good",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Critical" => Some(Self::Critical),
            "Low" => Some(Self::Low),
            "Good" => Some(Self::Good),
            _ => None,
        }
    }
}

impl fmt::Display for StockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current price and stock position of one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPerformanceRow {
    pub product_id: String,
    pub product_name: Option<String>,
    pub current_price: Option<f64>,
    pub current_stock: Option<i64>,
    pub stock_status: StockStatus,
    pub computed_at: DateTime<Utc>,
}

/// Point-in-time headline metric (e.g. `revenue_7d`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMetric {
    pub metric_name: String,
    pub metric_value: f64,
    pub computed_at: DateTime<Utc>,
}
