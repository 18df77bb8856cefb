//! Gold aggregate datasets.
//!
//! Each refresh is published as one [`GoldPublish`] and applied in a
//! single transaction, so readers see either the previous snapshot or
//! the new one. The cold-history frontier is stored alongside the data.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDate, Utc};
use medallion_types::gold::{
    DailyRevenueRow, DailySalesRow, KeyMetric, ProductPerformanceRow, StockStatus,
};
use rusqlite::{Connection, OptionalExtension, Transaction};

use crate::db;
use crate::error::{LakeError, Result};

const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS daily_sales_by_region (
    order_date TEXT NOT NULL,
    region TEXT NOT NULL,
    order_count INTEGER NOT NULL,
    total_revenue REAL NOT NULL,
    avg_order_value REAL NOT NULL,
    unique_customers INTEGER NOT NULL,
    computed_at TEXT NOT NULL,
    PRIMARY KEY (order_date, region)
);

CREATE TABLE IF NOT EXISTS daily_revenue (
    order_date TEXT PRIMARY KEY,
    order_count INTEGER NOT NULL,
    total_revenue REAL NOT NULL,
    computed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS product_performance (
    product_id TEXT PRIMARY KEY,
    product_name TEXT,
    current_price REAL,
    current_stock INTEGER,
    stock_status TEXT NOT NULL,
    computed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS key_metrics (
    metric_name TEXT PRIMARY KEY,
    metric_value REAL NOT NULL,
    computed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS gold_refresh_state (
    dataset TEXT PRIMARY KEY,
    cold_through TEXT NOT NULL,
    refreshed_at TEXT NOT NULL
);
";

const DAILY_SALES: &str = "daily_sales_by_region";
const DAILY_REVENUE: &str = "daily_revenue";

/// How the dated rows of a publish replace the stored ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DailySalesScope {
    /// Drop every stored row.
    All,
    /// Drop stored rows dated on or after this day; older rows are kept.
    From(NaiveDate),
}

/// One atomic gold refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct GoldPublish {
    pub daily_sales_scope: DailySalesScope,
    pub daily_sales: Vec<DailySalesRow>,
    /// Replaced under the same scope as `daily_sales`.
    pub daily_revenue: Vec<DailyRevenueRow>,
    pub product_performance: Vec<ProductPerformanceRow>,
    pub key_metrics: Vec<KeyMetric>,
    /// Dates before this are cold history and final.
    pub cold_through: NaiveDate,
}

/// Rows written by a publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub daily_sales_written: u64,
    pub daily_sales_replaced: u64,
    pub products_written: u64,
    pub metrics_written: u64,
}

/// Storage contract for the gold datasets.
pub trait GoldStore: Send + Sync {
    /// Apply a refresh in one transaction. On error the previous snapshot
    /// is untouched.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    fn publish(&self, update: &GoldPublish) -> Result<PublishSummary>;

    /// Cold-history frontier of the last publish, `None` before the first.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    fn cold_frontier(&self) -> Result<Option<NaiveDate>>;

    /// Daily sales rows in `[from, until)`, ordered by date then region.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    fn daily_sales(
        &self,
        from: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<Vec<DailySalesRow>>;

    /// All-region daily revenue rows in `[from, until)`, ordered by date.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    fn daily_revenue(
        &self,
        from: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<Vec<DailyRevenueRow>>;

    /// # Errors
    ///
    /// Returns a storage error.
    fn product_performance(&self) -> Result<Vec<ProductPerformanceRow>>;

    /// # Errors
    ///
    /// Returns a storage error.
    fn key_metrics(&self) -> Result<Vec<KeyMetric>>;
}

/// `SQLite`-backed [`GoldStore`].
pub struct SqliteGoldStore {
    conn: Mutex<Connection>,
}

impl SqliteGoldStore {
    /// # Errors
    ///
    /// Returns an error if the database can't be opened or initialized.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(db::open(path, CREATE_TABLES)?),
        })
    }

    /// # Errors
    ///
    /// Returns an error if the in-memory database can't be initialized.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(db::in_memory(CREATE_TABLES)?),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| LakeError::LockPoisoned)
    }
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
impl GoldStore for SqliteGoldStore {
    fn publish(&self, update: &GoldPublish) -> Result<PublishSummary> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| LakeError::sqlite("publish: begin tx", e))?;
        let mut summary = PublishSummary::default();

        summary.daily_sales_replaced = clear_dated(
            &tx,
            DAILY_SALES,
            update.daily_sales_scope,
            "publish: clear daily sales",
        )?;
        summary.daily_sales_written = insert_daily_sales(&tx, &update.daily_sales)?;
        clear_dated(
            &tx,
            DAILY_REVENUE,
            update.daily_sales_scope,
            "publish: clear daily revenue",
        )?;
        insert_daily_revenue(&tx, &update.daily_revenue)?;

        tx.execute("DELETE FROM product_performance", [])
            .map_err(|e| LakeError::sqlite("publish: clear product performance", e))?;
        summary.products_written = insert_products(&tx, &update.product_performance)?;

        tx.execute("DELETE FROM key_metrics", [])
            .map_err(|e| LakeError::sqlite("publish: clear key metrics", e))?;
        summary.metrics_written = insert_metrics(&tx, &update.key_metrics)?;

        tx.execute(
            "INSERT INTO gold_refresh_state (dataset, cold_through, refreshed_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(dataset) DO UPDATE SET cold_through = ?2, refreshed_at = ?3",
            rusqlite::params![
                DAILY_SALES,
                db::date_to_text(update.cold_through),
                db::ts_to_text(Utc::now())
            ],
        )
        .map_err(|e| LakeError::sqlite("publish: record frontier", e))?;

        tx.commit()
            .map_err(|e| LakeError::sqlite("publish: commit", e))?;
        Ok(summary)
    }

    fn cold_frontier(&self) -> Result<Option<NaiveDate>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT cold_through FROM gold_refresh_state WHERE dataset = ?1",
                [DAILY_SALES],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| LakeError::sqlite("cold_frontier", e))?;
        raw.map(|d| db::date_from_text(&d, "gold_refresh_state"))
            .transpose()
    }

    fn daily_sales(
        &self,
        from: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<Vec<DailySalesRow>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT order_date, region, order_count, total_revenue, avg_order_value, \
                 unique_customers, computed_at FROM daily_sales_by_region \
                 WHERE (?1 IS NULL OR order_date >= ?1) AND (?2 IS NULL OR order_date < ?2) \
                 ORDER BY order_date, region",
            )
            .map_err(|e| LakeError::sqlite("daily_sales: prepare", e))?;
        let rows = stmt
            .query_map(
                rusqlite::params![from.map(db::date_to_text), until.map(db::date_to_text)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .map_err(|e| LakeError::sqlite("daily_sales: query", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (date, region, count, revenue, avg, customers, computed_at) =
                row.map_err(|e| LakeError::sqlite("daily_sales: row", e))?;
            out.push(DailySalesRow {
                order_date: db::date_from_text(&date, DAILY_SALES)?,
                region,
                order_count: count as u64,
                total_revenue: revenue,
                avg_order_value: avg,
                unique_customers: customers as u64,
                computed_at: db::ts_from_text(&computed_at, DAILY_SALES)?,
            });
        }
        Ok(out)
    }

    fn daily_revenue(
        &self,
        from: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<Vec<DailyRevenueRow>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT order_date, order_count, total_revenue, computed_at FROM daily_revenue \
                 WHERE (?1 IS NULL OR order_date >= ?1) AND (?2 IS NULL OR order_date < ?2) \
                 ORDER BY order_date",
            )
            .map_err(|e| LakeError::sqlite("daily_revenue: prepare", e))?;
        let rows = stmt
            .query_map(
                rusqlite::params![from.map(db::date_to_text), until.map(db::date_to_text)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .map_err(|e| LakeError::sqlite("daily_revenue: query", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (date, count, revenue, computed_at) =
                row.map_err(|e| LakeError::sqlite("daily_revenue: row", e))?;
            out.push(DailyRevenueRow {
                order_date: db::date_from_text(&date, DAILY_REVENUE)?,
                order_count: count as u64,
                total_revenue: revenue,
                computed_at: db::ts_from_text(&computed_at, DAILY_REVENUE)?,
            });
        }
        Ok(out)
    }

    fn product_performance(&self) -> Result<Vec<ProductPerformanceRow>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT product_id, product_name, current_price, current_stock, stock_status, \
                 computed_at FROM product_performance ORDER BY product_id",
            )
            .map_err(|e| LakeError::sqlite("product_performance: prepare", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|e| LakeError::sqlite("product_performance: query", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (product_id, product_name, current_price, current_stock, status, computed_at) =
                row.map_err(|e| LakeError::sqlite("product_performance: row", e))?;
            let stock_status = StockStatus::parse(&status).ok_or_else(|| {
                LakeError::corrupt("product_performance", format!("unknown stock status {status:?}"))
            })?;
            out.push(ProductPerformanceRow {
                product_id,
                product_name,
                current_price,
                current_stock,
                stock_status,
                computed_at: db::ts_from_text(&computed_at, "product_performance")?,
            });
        }
        Ok(out)
    }

    fn key_metrics(&self) -> Result<Vec<KeyMetric>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare("SELECT metric_name, metric_value, computed_at FROM key_metrics ORDER BY metric_name")
            .map_err(|e| LakeError::sqlite("key_metrics: prepare", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| LakeError::sqlite("key_metrics: query", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (metric_name, metric_value, computed_at) =
                row.map_err(|e| LakeError::sqlite("key_metrics: row", e))?;
            out.push(KeyMetric {
                metric_name,
                metric_value,
                computed_at: db::ts_from_text(&computed_at, "key_metrics")?,
            });
        }
        Ok(out)
    }
}

/// Delete the rows of a dated table covered by `scope`.
#[allow(clippy::cast_sign_loss)]
fn clear_dated(
    tx: &Transaction<'_>,
    table: &str,
    scope: DailySalesScope,
    context: &'static str,
) -> Result<u64> {
    let deleted = match scope {
        DailySalesScope::All => tx.execute(&format!("DELETE FROM {table}"), []),
        DailySalesScope::From(from) => tx.execute(
            &format!("DELETE FROM {table} WHERE order_date >= ?1"),
            [db::date_to_text(from)],
        ),
    }
    .map_err(|e| LakeError::sqlite(context, e))?;
    Ok(deleted as u64)
}

#[allow(clippy::cast_possible_wrap)]
fn insert_daily_revenue(tx: &Transaction<'_>, rows: &[DailyRevenueRow]) -> Result<u64> {
    let mut stmt = tx
        .prepare(
            "INSERT OR REPLACE INTO daily_revenue \
             (order_date, order_count, total_revenue, computed_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .map_err(|e| LakeError::sqlite("publish: prepare daily revenue", e))?;
    let mut count = 0u64;
    for row in rows {
        stmt.execute(rusqlite::params![
            db::date_to_text(row.order_date),
            row.order_count as i64,
            row.total_revenue,
            db::ts_to_text(row.computed_at),
        ])
        .map_err(|e| LakeError::sqlite("publish: insert daily revenue", e))?;
        count += 1;
    }
    Ok(count)
}

#[allow(clippy::cast_possible_wrap)]
fn insert_daily_sales(tx: &Transaction<'_>, rows: &[DailySalesRow]) -> Result<u64> {
    let mut stmt = tx
        .prepare(
            "INSERT OR REPLACE INTO daily_sales_by_region \
             (order_date, region, order_count, total_revenue, avg_order_value, \
              unique_customers, computed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .map_err(|e| LakeError::sqlite("publish: prepare daily sales", e))?;
    let mut count = 0u64;
    for row in rows {
        stmt.execute(rusqlite::params![
            db::date_to_text(row.order_date),
            row.region,
            row.order_count as i64,
            row.total_revenue,
            row.avg_order_value,
            row.unique_customers as i64,
            db::ts_to_text(row.computed_at),
        ])
        .map_err(|e| LakeError::sqlite("publish: insert daily sales", e))?;
        count += 1;
    }
    Ok(count)
}

fn insert_products(tx: &Transaction<'_>, rows: &[ProductPerformanceRow]) -> Result<u64> {
    let mut stmt = tx
        .prepare(
            "INSERT OR REPLACE INTO product_performance \
             (product_id, product_name, current_price, current_stock, stock_status, computed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .map_err(|e| LakeError::sqlite("publish: prepare products", e))?;
    let mut count = 0u64;
    for row in rows {
        stmt.execute(rusqlite::params![
            row.product_id,
            row.product_name,
            row.current_price,
            row.current_stock,
            row.stock_status.as_str(),
            db::ts_to_text(row.computed_at),
        ])
        .map_err(|e| LakeError::sqlite("publish: insert products", e))?;
        count += 1;
    }
    Ok(count)
}

fn insert_metrics(tx: &Transaction<'_>, rows: &[KeyMetric]) -> Result<u64> {
    let mut stmt = tx
        .prepare(
            "INSERT OR REPLACE INTO key_metrics (metric_name, metric_value, computed_at) \
             VALUES (?1, ?2, ?3)",
        )
        .map_err(|e| LakeError::sqlite("publish: prepare metrics", e))?;
    let mut count = 0u64;
    for row in rows {
        stmt.execute(rusqlite::params![
            row.metric_name,
            row.metric_value,
            db::ts_to_text(row.computed_at),
        ])
        .map_err(|e| LakeError::sqlite("publish: insert metrics", e))?;
        count += 1;
    }
    Ok(count)
}
