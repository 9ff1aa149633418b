//! CSV-to-relational ingestion pipeline: normalization, dimension
//! resolution, review-data joining, and the transactional per-file driver.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use crest_core::{normalize_str, parse_float, parse_int, RatingCode};
use crest_store::{
    attachment_url_exists, find_named_id, find_stock_id_by_code, insert_named, insert_report,
    insert_stock, NamedDimension, NewReport, ReportStore, StoreError,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "crest-ingest";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("row {row}: invalid written_date {value:?} (expected YYYY-MM-DD)")]
    BadDate { row: usize, value: String },
    #[error("row {row}: missing stock code")]
    MissingStockCode { row: usize },
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows_read: usize,
    pub inserted: usize,
    pub skipped_duplicates: usize,
}

/// Primary CSV row as written by the listing scraper. Optional columns
/// degrade to null; everything is re-validated during normalization.
#[derive(Debug, Deserialize)]
struct RawReportRow {
    #[serde(default)]
    written_date: Option<String>,
    #[serde(default)]
    stock_name: Option<String>,
    #[serde(default)]
    stock_code: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    fair_price: Option<String>,
    #[serde(default)]
    current_price: Option<String>,
    #[serde(default)]
    expected_return: Option<String>,
    #[serde(default)]
    rating: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    broker: Option<String>,
    #[serde(default)]
    company_info_url: Option<String>,
    #[serde(default)]
    attachment_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReviewRow {
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    novice_content: Option<String>,
    #[serde(default)]
    expert_content: Option<String>,
}

/// Long-text fields joined onto a report from the secondary data set.
#[derive(Debug, Clone, Default)]
pub struct ReviewText {
    pub summary: Option<String>,
    pub novice_content: Option<String>,
    pub expert_content: Option<String>,
}

/// Lookup from report identifier to review text, keyed by the `<digits>.pdf`
/// filenames of the secondary CSV.
#[derive(Debug, Default)]
pub struct ReviewMap {
    by_report_idx: HashMap<String, ReviewText>,
}

impl ReviewMap {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the secondary CSV. Failure here is non-fatal: the run proceeds
    /// with no review data and null text fields.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(by_report_idx) => {
                debug!(entries = by_report_idx.len(), "review data loaded");
                Self { by_report_idx }
            }
            Err(err) => {
                warn!("review data unavailable, continuing without it: {err:#}");
                Self::empty()
            }
        }
    }

    fn try_load(path: &Path) -> anyhow::Result<HashMap<String, ReviewText>> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut reader = csv::Reader::from_reader(strip_bom(&text).as_bytes());
        let mut map = HashMap::new();
        for result in reader.deserialize::<RawReviewRow>() {
            let row = result.with_context(|| format!("parsing {}", path.display()))?;
            let Some(filename) = row.filename.as_deref() else {
                continue;
            };
            let Some(report_idx) = filename.strip_suffix(".pdf") else {
                continue;
            };
            map.insert(
                report_idx.to_string(),
                ReviewText {
                    summary: normalize_str(row.summary.as_deref()),
                    novice_content: normalize_str(row.novice_content.as_deref()),
                    expert_content: normalize_str(row.expert_content.as_deref()),
                },
            );
        }
        Ok(map)
    }

    pub fn len(&self) -> usize {
        self.by_report_idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_report_idx.is_empty()
    }

    /// Review text for a report's attachment URL. No URL, no extractable
    /// identifier, or no matching entry all yield empty text fields.
    pub fn for_attachment_url(&self, url: Option<&str>) -> ReviewText {
        url.and_then(extract_report_idx)
            .and_then(|idx| self.by_report_idx.get(&idx))
            .cloned()
            .unwrap_or_default()
    }
}

static REPORT_IDX_RE: OnceLock<Regex> = OnceLock::new();

/// Pull the numeric report identifier out of an attachment URL via the
/// `report_idx=<digits>` query-parameter convention. Any other URL shape is
/// "no match", never an error.
pub fn extract_report_idx(url: &str) -> Option<String> {
    let re = REPORT_IDX_RE
        .get_or_init(|| Regex::new(r"report_idx=(\d+)").expect("static pattern compiles"));
    re.captures(url).map(|caps| caps[1].to_string())
}

/// Per-run natural-key cache layered over the persistent store.
///
/// Lookup order is cache, then store by unique key, then create-and-persist
/// immediately so the new row's id serves later rows of the same run.
#[derive(Debug, Default)]
pub struct DimensionCache {
    stocks: HashMap<String, i64>,
    brokers: HashMap<String, i64>,
    authors: HashMap<String, i64>,
}

impl DimensionCache {
    /// Resolve a stock by code. Name and info URL only matter on first
    /// sighting; re-sightings never update the existing row.
    pub async fn resolve_stock(
        &mut self,
        conn: &mut SqliteConnection,
        stock_code: &str,
        stock_name: Option<&str>,
        company_info_url: Option<&str>,
    ) -> Result<i64, StoreError> {
        if let Some(id) = self.stocks.get(stock_code) {
            return Ok(*id);
        }
        let id = match find_stock_id_by_code(conn, stock_code).await? {
            Some(id) => id,
            None => {
                insert_stock(conn, stock_code, stock_name.unwrap_or(""), company_info_url).await?
            }
        };
        self.stocks.insert(stock_code.to_string(), id);
        Ok(id)
    }

    pub async fn resolve_broker(
        &mut self,
        conn: &mut SqliteConnection,
        name: Option<&str>,
    ) -> Result<Option<i64>, StoreError> {
        resolve_named(conn, &mut self.brokers, NamedDimension::Broker, name).await
    }

    pub async fn resolve_author(
        &mut self,
        conn: &mut SqliteConnection,
        name: Option<&str>,
    ) -> Result<Option<i64>, StoreError> {
        resolve_named(conn, &mut self.authors, NamedDimension::Author, name).await
    }
}

/// A blank key means "no association": the foreign key stays null and no
/// placeholder row is created.
async fn resolve_named(
    conn: &mut SqliteConnection,
    cache: &mut HashMap<String, i64>,
    dim: NamedDimension,
    name: Option<&str>,
) -> Result<Option<i64>, StoreError> {
    let Some(name) = name else {
        return Ok(None);
    };
    if let Some(id) = cache.get(name) {
        return Ok(Some(*id));
    }
    let id = match find_named_id(conn, dim, name).await? {
        Some(id) => id,
        None => insert_named(conn, dim, name).await?,
    };
    cache.insert(name.to_string(), id);
    Ok(Some(id))
}

/// Ingest one primary CSV, optionally joined against a reviews CSV, under a
/// single all-or-nothing transaction.
///
/// The store is assumed to have no other writer for the duration of the run;
/// the file-level transaction is the only coordination. Re-running over the
/// same or overlapping input is idempotent: rows whose attachment URL is
/// already persisted are skipped.
pub async fn ingest_reports(
    store: &ReportStore,
    reports_csv: &Path,
    reviews_csv: Option<&Path>,
) -> Result<IngestSummary, IngestError> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    let reviews = match reviews_csv {
        Some(path) => ReviewMap::load(path),
        None => ReviewMap::empty(),
    };

    let text = tokio::fs::read_to_string(reports_csv)
        .await
        .map_err(|source| IngestError::Io {
            path: reports_csv.display().to_string(),
            source,
        })?;
    let mut reader = csv::Reader::from_reader(strip_bom(&text).as_bytes());

    let mut tx = store.begin().await.map_err(IngestError::Store)?;
    let mut cache = DimensionCache::default();

    let mut rows_read = 0usize;
    let mut inserted = 0usize;
    let mut skipped_duplicates = 0usize;

    for (idx, result) in reader.deserialize::<RawReportRow>().enumerate() {
        let row_no = idx + 1;
        let raw = result?;
        rows_read += 1;

        // The date is the one strictly-validated scalar: a malformed value
        // aborts the whole run rather than degrading to null.
        let date_text = normalize_str(raw.written_date.as_deref()).ok_or(IngestError::BadDate {
            row: row_no,
            value: String::new(),
        })?;
        let written_date = NaiveDate::parse_from_str(&date_text, "%Y-%m-%d").map_err(|_| {
            IngestError::BadDate {
                row: row_no,
                value: date_text.clone(),
            }
        })?;

        let stock_code = normalize_str(raw.stock_code.as_deref())
            .ok_or(IngestError::MissingStockCode { row: row_no })?;
        let stock_name = normalize_str(raw.stock_name.as_deref());
        let title = normalize_str(raw.title.as_deref());
        let fair_price = parse_int(raw.fair_price.as_deref());
        let current_price = parse_int(raw.current_price.as_deref());
        let expected_return = parse_float(raw.expected_return.as_deref());
        let rating_code = RatingCode::classify(raw.rating.as_deref());
        let author_name = normalize_str(raw.author.as_deref());
        let broker_name = normalize_str(raw.broker.as_deref());
        let company_info_url = normalize_str(raw.company_info_url.as_deref());
        let attachment_url = normalize_str(raw.attachment_url.as_deref());

        if let Some(url) = attachment_url.as_deref() {
            if attachment_url_exists(&mut tx, url).await? {
                debug!(row = row_no, url, "duplicate attachment_url, skipping");
                skipped_duplicates += 1;
                continue;
            }
        }

        let stock_id = cache
            .resolve_stock(
                &mut tx,
                &stock_code,
                stock_name.as_deref(),
                company_info_url.as_deref(),
            )
            .await?;
        let broker_id = cache.resolve_broker(&mut tx, broker_name.as_deref()).await?;
        let author_id = cache.resolve_author(&mut tx, author_name.as_deref()).await?;

        let review = reviews.for_attachment_url(attachment_url.as_deref());

        insert_report(
            &mut tx,
            &NewReport {
                written_date,
                title: title.unwrap_or_default(),
                fair_price,
                current_price,
                expected_return,
                attachment_url,
                summary: review.summary,
                novice_content: review.novice_content,
                expert_content: review.expert_content,
                stock_id,
                broker_id,
                author_id,
                rating_code,
            },
        )
        .await?;
        inserted += 1;
    }

    tx.commit().await.map_err(StoreError::from)?;

    let finished_at = Utc::now();
    info!(
        %run_id,
        rows_read,
        inserted,
        skipped_duplicates,
        "ingestion run committed"
    );

    Ok(IngestSummary {
        run_id,
        started_at,
        finished_at,
        rows_read,
        inserted,
        skipped_duplicates,
    })
}

fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const PRIMARY_HEADER: &str = "written_date,stock_name,stock_code,title,fair_price,current_price,expected_return,rating,author,broker,company_info_url,attachment_url";

    async fn temp_store(dir: &TempDir) -> ReportStore {
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("crest.db").display());
        let store = ReportStore::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");
        store
    }

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).expect("write fixture");
        path
    }

    fn primary_csv(rows: &[&str]) -> String {
        let mut out = String::from(PRIMARY_HEADER);
        for row in rows {
            out.push('\n');
            out.push_str(row);
        }
        out
    }

    #[test]
    fn report_idx_extraction_follows_the_query_parameter_convention() {
        assert_eq!(
            extract_report_idx("https://example.com/downpdf?report_idx=644855"),
            Some("644855".to_string())
        );
        assert_eq!(extract_report_idx("https://example.com/644855.pdf"), None);
        assert_eq!(extract_report_idx("report_idx="), None);
    }

    #[test]
    fn missing_reviews_file_yields_an_empty_map() {
        let map = ReviewMap::load(Path::new("/nonexistent/reviews.csv"));
        assert!(map.is_empty());
        let text = map.for_attachment_url(Some("https://x?report_idx=1"));
        assert!(text.summary.is_none());
    }

    #[tokio::test]
    async fn ingest_joins_reviews_and_resolves_dimensions() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;

        let reviews = write_file(
            &dir,
            "reviews.csv",
            "filename,summary,novice_content,expert_content\n\
             644830.pdf,요약 한 줄,초보자용 설명,전문가용 설명\n",
        );
        let reports = write_file(
            &dir,
            "reports.csv",
            &primary_csv(&[
                "2024-05-02,삼양식품,003230,불닭의 확장,\"1,000,000\",820000,21.9,Buy,전유진,메리츠증권,https://info/003230,https://x/downpdf?report_idx=644830",
                "2024-05-03,삼양식품,003230,목표가 상향,950000,830000,14.5,매수,전유진,메리츠증권,https://info/003230,https://x/downpdf?report_idx=644831",
                "2024-05-04,삼성전자,005930,반도체 업데이트,abc,70000,,,,,,https://x/downpdf?report_idx=644832",
            ]),
        );

        let summary = ingest_reports(&store, &reports, Some(&reviews))
            .await
            .expect("ingest");
        assert_eq!(summary.rows_read, 3);
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.skipped_duplicates, 0);

        let rows = store.search_reports(None).await.unwrap();
        assert_eq!(rows.len(), 3);

        // Both 삼양식품 rows resolve to the same stock row.
        let stock_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stocks")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(stock_count, 2);
        let broker_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM brokers")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(broker_count, 1);

        // Review text joined via report_idx=644830 only.
        let joined = rows
            .iter()
            .find(|r| r.attachment_url.as_deref() == Some("https://x/downpdf?report_idx=644830"))
            .unwrap();
        assert_eq!(joined.summary.as_deref(), Some("요약 한 줄"));
        assert_eq!(joined.fair_price, Some(1_000_000));
        assert_eq!(joined.rating_code, "Buy");

        // Row 3: blank broker/author stay null, garbage price is null,
        // blank rating classifies as None.
        let degraded = rows
            .iter()
            .find(|r| r.stock_code == "005930")
            .unwrap();
        assert!(degraded.broker_name.is_none());
        assert!(degraded.author_name.is_none());
        assert!(degraded.fair_price.is_none());
        assert_eq!(degraded.rating_code, "None");
        assert!(degraded.summary.is_none());
    }

    #[tokio::test]
    async fn reingesting_the_same_file_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;
        let reports = write_file(
            &dir,
            "reports.csv",
            &primary_csv(&[
                "2024-05-02,삼양식품,003230,첫 리포트,900000,820000,9.8,Buy,전유진,메리츠증권,,https://x/downpdf?report_idx=1",
                "2024-05-03,삼양식품,003230,둘째 리포트,910000,825000,10.3,Hold,전유진,메리츠증권,,https://x/downpdf?report_idx=2",
            ]),
        );

        let first = ingest_reports(&store, &reports, None).await.unwrap();
        assert_eq!(first.inserted, 2);

        let second = ingest_reports(&store, &reports, None).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped_duplicates, 2);
        assert_eq!(store.count_reports().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_attachment_url_within_one_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;
        let reports = write_file(
            &dir,
            "reports.csv",
            &primary_csv(&[
                "2024-05-02,삼양식품,003230,원본,900000,820000,9.8,Buy,,,,https://x/downpdf?report_idx=7",
                "2024-05-02,삼양식품,003230,중복,900000,820000,9.8,Buy,,,,https://x/downpdf?report_idx=7",
            ]),
        );

        let summary = ingest_reports(&store, &reports, None).await.unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.skipped_duplicates, 1);
    }

    #[tokio::test]
    async fn bad_date_aborts_and_rolls_back_the_whole_run() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;
        let reports = write_file(
            &dir,
            "reports.csv",
            &primary_csv(&[
                "2024-05-02,삼양식품,003230,정상 행,900000,820000,9.8,Buy,,,,https://x/downpdf?report_idx=11",
                "05/03/2024,삼성전자,005930,날짜 형식 오류,70000,68000,2.9,Hold,,,,https://x/downpdf?report_idx=12",
            ]),
        );

        let err = ingest_reports(&store, &reports, None).await.unwrap_err();
        assert!(matches!(err, IngestError::BadDate { row: 2, .. }));

        // Nothing from the failed run survives, including the valid first row
        // and its dimension rows.
        assert_eq!(store.count_reports().await.unwrap(), 0);
        let stock_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stocks")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(stock_count, 0);
    }

    #[tokio::test]
    async fn bom_and_missing_optional_columns_are_tolerated() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir).await;
        let reports = write_file(
            &dir,
            "reports.csv",
            "\u{feff}written_date,stock_name,stock_code,title,rating\n\
             2024-04-01,카카오,035720,플랫폼 회복,매도\n",
        );

        let summary = ingest_reports(&store, &reports, None).await.unwrap();
        assert_eq!(summary.inserted, 1);
        let rows = store.search_reports(Some("카카오")).await.unwrap();
        assert_eq!(rows[0].rating_code, "Sell");
        assert!(rows[0].attachment_url.is_none());
    }
}
