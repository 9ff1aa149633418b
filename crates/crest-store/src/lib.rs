//! SQLite persistence layer for CREST: schema, dimension upserts, fact
//! inserts, and the read queries behind the web layer.

use chrono::NaiveDate;
use crest_core::RatingCode;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool, Transaction};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "crest-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Handle to the report database. Constructed once in the binary and passed
/// down explicitly; there is no module-level connection state.
#[derive(Debug, Clone)]
pub struct ReportStore {
    pool: SqlitePool,
}

/// Joined report row as served to consumers, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub id: i64,
    pub written_date: NaiveDate,
    pub title: String,
    pub stock_code: String,
    pub stock_name: String,
    pub broker_name: Option<String>,
    pub author_name: Option<String>,
    pub rating_code: String,
    pub fair_price: Option<i64>,
    pub current_price: Option<i64>,
    pub expected_return: Option<f64>,
    pub attachment_url: Option<String>,
    pub summary: Option<String>,
    pub novice_content: Option<String>,
    pub expert_content: Option<String>,
}

/// One `stock_summary` view row.
#[derive(Debug, Clone, Serialize)]
pub struct StockSummaryRow {
    pub stock_code: String,
    pub stock_name: String,
    pub current_price: Option<i64>,
    pub avg_fair_price: Option<f64>,
    pub avg_expected_return: Option<f64>,
    pub main_rating: Option<String>,
}

/// Fact row staged by the ingestion driver. Reports are immutable once
/// inserted; there is no update path.
#[derive(Debug, Clone)]
pub struct NewReport {
    pub written_date: NaiveDate,
    pub title: String,
    pub fair_price: Option<i64>,
    pub current_price: Option<i64>,
    pub expected_return: Option<f64>,
    pub attachment_url: Option<String>,
    pub summary: Option<String>,
    pub novice_content: Option<String>,
    pub expert_content: Option<String>,
    pub stock_id: i64,
    pub broker_id: Option<i64>,
    pub author_id: Option<i64>,
    pub rating_code: RatingCode,
}

/// Dimension entities keyed by a unique `name` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedDimension {
    Broker,
    Author,
}

impl NamedDimension {
    fn table(&self) -> &'static str {
        match self {
            NamedDimension::Broker => "brokers",
            NamedDimension::Author => "authors",
        }
    }
}

const STOCK_SUMMARY_VIEW_SQL: &str = r#"
CREATE VIEW stock_summary AS
SELECT
    s.stock_code AS stock_code,
    s.stock_name AS stock_name,
    (
        SELECT r2.current_price
        FROM reports r2
        WHERE r2.stock_id = s.id
        ORDER BY r2.written_date DESC, r2.id DESC
        LIMIT 1
    ) AS current_price,
    AVG(r.fair_price) AS avg_fair_price,
    AVG(r.expected_return) AS avg_expected_return,
    (
        SELECT r3.rating_code
        FROM reports r3
        WHERE r3.stock_id = s.id
        ORDER BY r3.written_date DESC, r3.id DESC
        LIMIT 1
    ) AS main_rating
FROM stocks s
JOIN reports r ON r.stock_id = s.id
GROUP BY s.id, s.stock_code, s.stock_name
"#;

const REPORT_SELECT_SQL: &str = r#"
SELECT r.id, r.written_date, r.title, r.fair_price, r.current_price,
       r.expected_return, r.attachment_url, r.summary, r.novice_content,
       r.expert_content, r.rating_code,
       s.stock_code, s.stock_name,
       b.name AS broker_name,
       a.name AS author_name
  FROM reports r
  JOIN stocks s ON s.id = r.stock_id
  LEFT JOIN brokers b ON b.id = r.broker_id
  LEFT JOIN authors a ON a.id = r.author_id
"#;

impl ReportStore {
    /// Open a pool against `database_url`, e.g. `sqlite:crest.db?mode=rwc`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables, indexes, the four rating codes, and the summary view.
    /// Safe to run repeatedly.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, sqlx::Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    pub async fn count_reports(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM reports")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_ratings(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM ratings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Reports newest first, optionally filtered by a case-insensitive
    /// substring match across stock name, broker name, and author name.
    pub async fn search_reports(&self, q: Option<&str>) -> Result<Vec<ReportRow>, StoreError> {
        let order = " ORDER BY r.written_date DESC, r.id DESC";
        let rows = match q.map(str::trim).filter(|q| !q.is_empty()) {
            Some(q) => {
                let pattern = format!("%{q}%");
                let sql = format!(
                    "{REPORT_SELECT_SQL} WHERE s.stock_name LIKE ? OR b.name LIKE ? OR a.name LIKE ?{order}"
                );
                sqlx::query(&sql)
                    .bind(&pattern)
                    .bind(&pattern)
                    .bind(&pattern)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("{REPORT_SELECT_SQL}{order}");
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };
        rows.into_iter()
            .map(|row| report_row_from(&row))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    pub async fn stock_summaries(&self) -> Result<Vec<StockSummaryRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT stock_code, stock_name, current_price, avg_fair_price, \
             avg_expected_return, main_rating FROM stock_summary ORDER BY stock_code",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StockSummaryRow {
                stock_code: row.try_get("stock_code")?,
                stock_name: row.try_get("stock_name")?,
                current_price: row.try_get("current_price")?,
                avg_fair_price: row.try_get("avg_fair_price")?,
                avg_expected_return: row.try_get("avg_expected_return")?,
                main_rating: row.try_get("main_rating")?,
            });
        }
        Ok(out)
    }

    /// Drop and recreate the `stock_summary` view from current fact data.
    /// The view carries no state of its own, so recomputation is idempotent.
    pub async fn refresh_stock_summary(&self) -> Result<(), StoreError> {
        sqlx::query("DROP VIEW IF EXISTS stock_summary")
            .execute(&self.pool)
            .await?;
        sqlx::query(STOCK_SUMMARY_VIEW_SQL)
            .execute(&self.pool)
            .await?;
        debug!("stock_summary view refreshed");
        Ok(())
    }

    /// Single write needed by the out-of-band price refresher. Returns false
    /// when no stock carries `stock_code`.
    pub async fn update_stock_price(
        &self,
        stock_code: &str,
        price: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE stocks SET current_price = ? WHERE stock_code = ?")
            .bind(price)
            .bind(stock_code)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

pub async fn find_stock_id_by_code(
    conn: &mut SqliteConnection,
    stock_code: &str,
) -> Result<Option<i64>, StoreError> {
    let row = sqlx::query("SELECT id FROM stocks WHERE stock_code = ?")
        .bind(stock_code)
        .fetch_optional(conn)
        .await?;
    Ok(row.map(|r| r.get("id")))
}

/// Insert a stock on first sighting. Name and info URL are fixed at creation
/// and never updated by later sightings of the same code.
pub async fn insert_stock(
    conn: &mut SqliteConnection,
    stock_code: &str,
    stock_name: &str,
    company_info_url: Option<&str>,
) -> Result<i64, StoreError> {
    let result =
        sqlx::query("INSERT INTO stocks (stock_code, stock_name, company_info_url) VALUES (?, ?, ?)")
            .bind(stock_code)
            .bind(stock_name)
            .bind(company_info_url)
            .execute(conn)
            .await?;
    Ok(result.last_insert_rowid())
}

pub async fn find_named_id(
    conn: &mut SqliteConnection,
    dim: NamedDimension,
    name: &str,
) -> Result<Option<i64>, StoreError> {
    let sql = format!("SELECT id FROM {} WHERE name = ?", dim.table());
    let row = sqlx::query(&sql).bind(name).fetch_optional(conn).await?;
    Ok(row.map(|r| r.get("id")))
}

pub async fn insert_named(
    conn: &mut SqliteConnection,
    dim: NamedDimension,
    name: &str,
) -> Result<i64, StoreError> {
    let sql = format!("INSERT INTO {} (name) VALUES (?)", dim.table());
    let result = sqlx::query(&sql).bind(name).execute(conn).await?;
    Ok(result.last_insert_rowid())
}

/// Dedup probe for the ingestion driver. Runs inside the open transaction,
/// so rows staged earlier in the same run are visible too.
pub async fn attachment_url_exists(
    conn: &mut SqliteConnection,
    attachment_url: &str,
) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT 1 FROM reports WHERE attachment_url = ? LIMIT 1")
        .bind(attachment_url)
        .fetch_optional(conn)
        .await?;
    Ok(row.is_some())
}

pub async fn insert_report(
    conn: &mut SqliteConnection,
    report: &NewReport,
) -> Result<i64, StoreError> {
    let result = sqlx::query(
        "INSERT INTO reports (written_date, title, fair_price, current_price, \
         expected_return, attachment_url, summary, novice_content, expert_content, \
         stock_id, broker_id, author_id, rating_code) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(report.written_date)
    .bind(&report.title)
    .bind(report.fair_price)
    .bind(report.current_price)
    .bind(report.expected_return)
    .bind(&report.attachment_url)
    .bind(&report.summary)
    .bind(&report.novice_content)
    .bind(&report.expert_content)
    .bind(report.stock_id)
    .bind(report.broker_id)
    .bind(report.author_id)
    .bind(report.rating_code.as_str())
    .execute(conn)
    .await?;
    Ok(result.last_insert_rowid())
}

fn report_row_from(row: &SqliteRow) -> Result<ReportRow, sqlx::Error> {
    Ok(ReportRow {
        id: row.try_get("id")?,
        written_date: row.try_get("written_date")?,
        title: row.try_get("title")?,
        stock_code: row.try_get("stock_code")?,
        stock_name: row.try_get("stock_name")?,
        broker_name: row.try_get("broker_name")?,
        author_name: row.try_get("author_name")?,
        rating_code: row.try_get("rating_code")?,
        fair_price: row.try_get("fair_price")?,
        current_price: row.try_get("current_price")?,
        expected_return: row.try_get("expected_return")?,
        attachment_url: row.try_get("attachment_url")?,
        summary: row.try_get("summary")?,
        novice_content: row.try_get("novice_content")?,
        expert_content: row.try_get("expert_content")?,
    })
}
