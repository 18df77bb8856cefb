//! Gold aggregation over the canonical silver rows.
//!
//! `daily_sales_by_region` is split at `window_start = today - hot_window_days`:
//! the hot window is recomputed on every run, cold history is written once
//! (first run or full refresh) and left alone afterwards. An all-region
//! `daily_revenue` row per date is kept under the same split, so the
//! look-back metrics read cold days from gold and an incremental run scans
//! only the hot window of silver. Product performance and key metrics are
//! small snapshots, replaced every run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, Utc};
use medallion_lake::{DailySalesScope, GoldPublish, GoldStore, PublishSummary, SilverStore};
use medallion_types::event::EntityType;
use medallion_types::gold::{
    DailyRevenueRow, DailySalesRow, KeyMetric, ProductPerformanceRow, StockStatus,
};
use medallion_types::silver::SilverRow;

use crate::config::types::{GoldConfig, GoldFields, StockThresholds};
use crate::errors::PipelineError;
use crate::execution::{RefreshMode, StageBudget};

/// Longest look-back of the key metrics.
pub const METRICS_HORIZON_DAYS: u64 = 90;

const ORDER_DATE_TIME_FMT: &str = "%Y-%m-%d %H:%M:%S";
const ORDER_DATE_FMT: &str = "%Y-%m-%d";

/// Business date of an order timestamp.
#[must_use]
pub fn parse_order_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, ORDER_DATE_TIME_FMT) {
        return Some(dt.date());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, ORDER_DATE_FMT) {
        return Some(date);
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive())
}

/// The attributes of one order the aggregates need.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFact {
    pub date: NaiveDate,
    pub amount: f64,
    pub region: Option<String>,
    pub customer_id: Option<String>,
}

/// Extract order facts; rows without a usable date or amount are skipped
/// and counted.
#[must_use]
pub fn order_facts(rows: &[SilverRow], fields: &GoldFields) -> (Vec<OrderFact>, u64) {
    let mut facts = Vec::with_capacity(rows.len());
    let mut skipped = 0u64;
    for row in rows.iter().filter(|r| !r.deleted) {
        let date = row
            .text(&fields.order_date)
            .as_deref()
            .and_then(parse_order_date);
        let amount = row.number(&fields.order_amount).filter(|a| a.is_finite());
        let (Some(date), Some(amount)) = (date, amount) else {
            tracing::debug!(order = row.primary_key, "Skipping order without date or amount");
            skipped += 1;
            continue;
        };
        facts.push(OrderFact {
            date,
            amount,
            region: row.text(&fields.region).filter(|r| !r.is_empty()),
            customer_id: row.text(&fields.customer_id),
        });
    }
    (facts, skipped)
}

#[derive(Default)]
struct DailyAccumulator {
    orders: u64,
    revenue: f64,
    customers: BTreeSet<String>,
}

/// Daily revenue per region for order dates on or after `from`. Orders
/// without a region are left out.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn daily_sales(
    facts: &[OrderFact],
    from: Option<NaiveDate>,
    computed_at: DateTime<Utc>,
) -> Vec<DailySalesRow> {
    let mut groups: BTreeMap<(NaiveDate, &str), DailyAccumulator> = BTreeMap::new();
    for fact in facts {
        if from.is_some_and(|f| fact.date < f) {
            continue;
        }
        let Some(region) = fact.region.as_deref() else {
            continue;
        };
        let acc = groups.entry((fact.date, region)).or_default();
        acc.orders += 1;
        acc.revenue += fact.amount;
        if let Some(customer) = &fact.customer_id {
            acc.customers.insert(customer.clone());
        }
    }

    groups
        .into_iter()
        .map(|((order_date, region), acc)| DailySalesRow {
            order_date,
            region: region.to_string(),
            order_count: acc.orders,
            total_revenue: acc.revenue,
            avg_order_value: acc.revenue / acc.orders as f64,
            unique_customers: acc.customers.len() as u64,
            computed_at,
        })
        .collect()
}

/// Order count and revenue per order date on or after `from`, whether or
/// not the order has a region.
#[must_use]
pub fn daily_revenue(
    facts: &[OrderFact],
    from: Option<NaiveDate>,
    computed_at: DateTime<Utc>,
) -> Vec<DailyRevenueRow> {
    let mut days: BTreeMap<NaiveDate, (u64, f64)> = BTreeMap::new();
    for fact in facts {
        if from.is_some_and(|f| fact.date < f) {
            continue;
        }
        let day = days.entry(fact.date).or_default();
        day.0 += 1;
        day.1 += fact.amount;
    }
    days.into_iter()
        .map(|(order_date, (order_count, total_revenue))| DailyRevenueRow {
            order_date,
            order_count,
            total_revenue,
            computed_at,
        })
        .collect()
}

/// Stock position of one product.
#[must_use]
pub fn stock_status(stock: Option<i64>, thresholds: StockThresholds) -> StockStatus {
    match stock {
        Some(level) if level >= thresholds.low => StockStatus::Good,
        Some(level) if level >= thresholds.critical => StockStatus::Low,
        // Unknown stock is treated as empty.
        _ => StockStatus::Critical,
    }
}

#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn product_performance(
    rows: &[SilverRow],
    fields: &GoldFields,
    thresholds: StockThresholds,
    computed_at: DateTime<Utc>,
) -> Vec<ProductPerformanceRow> {
    rows.iter()
        .filter(|r| !r.deleted)
        .map(|row| {
            let current_stock = row
                .number(&fields.stock_level)
                .filter(|s| s.is_finite())
                .map(|s| s as i64);
            ProductPerformanceRow {
                product_id: row.primary_key.clone(),
                product_name: row.text(&fields.product_name),
                current_price: row.number(&fields.price),
                current_stock,
                stock_status: stock_status(current_stock, thresholds),
                computed_at,
            }
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn key_metrics(
    days: &[DailyRevenueRow],
    today: NaiveDate,
    computed_at: DateTime<Utc>,
) -> Vec<KeyMetric> {
    let revenue_since = |back: u64| -> f64 {
        let from = today.checked_sub_days(Days::new(back)).unwrap_or(NaiveDate::MIN);
        days.iter()
            .filter(|d| d.order_date >= from)
            .map(|d| d.total_revenue)
            .sum()
    };
    let todays = days.iter().filter(|d| d.order_date == today);

    [
        ("orders_today", todays.clone().map(|d| d.order_count as f64).sum::<f64>()),
        ("revenue_today", todays.map(|d| d.total_revenue).sum::<f64>()),
        ("revenue_7d", revenue_since(7)),
        ("revenue_30d", revenue_since(30)),
        ("revenue_90d", revenue_since(METRICS_HORIZON_DAYS)),
    ]
    .into_iter()
    .map(|(name, value)| KeyMetric {
        metric_name: name.to_string(),
        metric_value: value,
        computed_at,
    })
    .collect()
}

/// What one refresh did.
#[derive(Debug, Clone, PartialEq)]
pub struct GoldRefreshOutcome {
    pub full_refresh: bool,
    pub window_start: NaiveDate,
    pub orders_read: u64,
    pub skipped_orders: u64,
    pub summary: PublishSummary,
}

/// Recomputes gold from silver and publishes it atomically.
pub struct GoldAggregator {
    silver: Arc<dyn SilverStore>,
    gold: Arc<dyn GoldStore>,
    config: GoldConfig,
}

impl GoldAggregator {
    pub fn new(silver: Arc<dyn SilverStore>, gold: Arc<dyn GoldStore>, config: GoldConfig) -> Self {
        Self {
            silver,
            gold,
            config,
        }
    }

    /// Blocking; run it on the blocking pool.
    ///
    /// # Errors
    ///
    /// Storage errors, or `Timeout` if the budget is spent before publish.
    pub fn refresh(
        &self,
        mode: RefreshMode,
        today: NaiveDate,
        budget: &StageBudget,
    ) -> Result<GoldRefreshOutcome, PipelineError> {
        let window_start = today
            .checked_sub_days(Days::new(u64::from(self.config.hot_window_days)))
            .unwrap_or(NaiveDate::MIN);
        let frontier = self.gold.cold_frontier()?;
        let full = mode == RefreshMode::Full || frontier.is_none();

        let orders_entity = EntityType::new(self.config.orders_entity.as_str());
        let orders = if full {
            self.silver.scan(&orders_entity)?
        } else {
            self.silver.scan_date_range(
                &orders_entity,
                &self.config.fields.order_date,
                Some(window_start),
                None,
            )?
        };
        let products = self
            .silver
            .scan(&EntityType::new(self.config.products_entity.as_str()))?;

        let computed_at = Utc::now();
        let (facts, skipped_orders) = order_facts(&orders, &self.config.fields);
        let (daily_from, scope) = if full {
            (None, DailySalesScope::All)
        } else {
            (Some(window_start), DailySalesScope::From(window_start))
        };

        let revenue = daily_revenue(&facts, daily_from, computed_at);
        let mut metric_days = if full {
            Vec::new()
        } else {
            let metrics_start = today
                .checked_sub_days(Days::new(METRICS_HORIZON_DAYS))
                .unwrap_or(NaiveDate::MIN);
            self.gold
                .daily_revenue(Some(metrics_start), Some(window_start))?
        };
        metric_days.extend(revenue.iter().cloned());

        let publish = GoldPublish {
            daily_sales_scope: scope,
            daily_sales: daily_sales(&facts, daily_from, computed_at),
            daily_revenue: revenue,
            product_performance: product_performance(
                &products,
                &self.config.fields,
                self.config.stock_thresholds,
                computed_at,
            ),
            key_metrics: key_metrics(&metric_days, today, computed_at),
            cold_through: window_start,
        };

        budget.check("gold publish")?;
        let summary = self.gold.publish(&publish)?;

        tracing::info!(
            full_refresh = full,
            window_start = %window_start,
            previous_frontier = ?frontier,
            orders_read = orders.len(),
            skipped_orders,
            daily_sales_written = summary.daily_sales_written,
            daily_sales_replaced = summary.daily_sales_replaced,
            products_written = summary.products_written,
            "Gold refreshed"
        );

        Ok(GoldRefreshOutcome {
            full_refresh: full,
            window_start,
            orders_read: orders.len() as u64,
            skipped_orders,
            summary,
        })
    }
}
