//! Extract-load pipeline: lazy extraction from the complaint API, immutable
//! parquet landing partitions, and keyed merge into the DuckDB warehouse.

use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{
    BooleanArray, Date32Array, RecordBatch, StringArray, TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use async_trait::async_trait;
use ccdb_client::{
    CfpbClient, ClientConfig, ComplaintQuery, ComplaintSearch, FetchError, MAX_PAGE_SIZE,
};
use ccdb_core::{day_label, resolve_complaint_id, sanitize_label, ComplaintRecord};
use chrono::{DateTime, NaiveDate, Utc};
use duckdb::Connection;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ccdb-pipeline";

pub const WAREHOUSE_TABLE: &str = "raw.cfpb_complaints";

const WAREHOUSE_DDL: &str = "\
CREATE SCHEMA IF NOT EXISTS raw;
CREATE TABLE IF NOT EXISTS raw.cfpb_complaints (
    complaint_id VARCHAR PRIMARY KEY,
    date_received DATE,
    company VARCHAR,
    product VARCHAR,
    sub_product VARCHAR,
    issue VARCHAR,
    company_response VARCHAR,
    is_timely_response BOOLEAN,
    state VARCHAR,
    submitted_via VARCHAR,
    consumer_consent_provided VARCHAR,
    _extracted_at TIMESTAMP
);";

const WAREHOUSE_COLUMNS: &str = "complaint_id, date_received, company, product, sub_product, \
issue, company_response, is_timely_response, state, submitted_via, \
consumer_consent_provided, _extracted_at";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    pub landing_root: PathBuf,
    pub companies: Vec<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub merge_enabled: bool,
}

/// Default backfill roster of frequently complained-about companies.
pub const DEFAULT_COMPANIES: [&str; 8] = [
    "JPMorgan Chase",
    "Bank of America",
    "Wells Fargo",
    "Citibank",
    "Capital One",
    "Equifax",
    "Experian",
    "TransUnion",
];

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("CCDB_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("database/cfpb_complaints.duckdb")),
            landing_root: std::env::var("CCDB_LANDING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("landing/cfpb_complaints")),
            companies: std::env::var("CCDB_COMPANIES")
                .map(|v| {
                    v.split(',')
                        .map(|c| c.trim().to_string())
                        .filter(|c| !c.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| DEFAULT_COMPANIES.iter().map(|c| c.to_string()).collect()),
            user_agent: std::env::var("CCDB_USER_AGENT")
                .unwrap_or_else(|_| ccdb_client::DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("CCDB_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            merge_enabled: std::env::var("CCDB_MERGE_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
        }
    }
}

/// Lazy, forward-only stream of resolved complaint records.
///
/// Owns its API client and pulls pages on demand; identity resolution and the
/// batch `_extracted_at` stamp (captured once at construction) are applied as
/// records are yielded. The client session is released when the stream is
/// dropped, on every exit path.
pub struct ComplaintStream<A: ComplaintSearch> {
    api: A,
    query: ComplaintQuery,
    max_records: Option<usize>,
    extracted_at: DateTime<Utc>,
    buffer: VecDeque<Map<String, Value>>,
    yielded: usize,
    fetched: usize,
    exhausted: bool,
}

impl<A: ComplaintSearch> ComplaintStream<A> {
    pub fn new(api: A, mut query: ComplaintQuery, max_records: Option<usize>) -> Self {
        query.frm = 0;
        Self {
            api,
            query,
            max_records,
            extracted_at: Utc::now(),
            buffer: VecDeque::new(),
            yielded: 0,
            fetched: 0,
            exhausted: false,
        }
    }

    pub fn extracted_at(&self) -> DateTime<Utc> {
        self.extracted_at
    }

    /// Pull the next record, fetching a new page only when the buffer runs
    /// dry. Single-pass: once `None` is returned the stream stays empty.
    pub async fn next_record(&mut self) -> Result<Option<ComplaintRecord>, FetchError> {
        loop {
            if let Some(cap) = self.max_records {
                if self.yielded >= cap {
                    return Ok(None);
                }
            }

            if let Some(raw) = self.buffer.pop_front() {
                let complaint_id = resolve_complaint_id(&raw);
                self.yielded += 1;
                return Ok(Some(ComplaintRecord::from_source(
                    &raw,
                    complaint_id,
                    self.extracted_at,
                )));
            }

            if self.exhausted {
                return Ok(None);
            }

            let page = self.api.search(&self.query).await?;
            if page.records.is_empty() {
                self.exhausted = true;
                continue;
            }

            self.fetched += page.records.len();
            if page.total_available > 0 && self.fetched as u64 >= page.total_available {
                self.exhausted = true;
            }
            self.query.frm += self.query.size.min(MAX_PAGE_SIZE);
            self.buffer.extend(page.records);
        }
    }

    /// Drain the stream, consuming it so the client is released on return.
    pub async fn collect(mut self) -> Result<Vec<ComplaintRecord>, FetchError> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record().await? {
            records.push(record);
        }
        Ok(records)
    }
}

/// `<root>/<YYYY_MM_DD>/<sanitized_company>_<date_min>_<date_max>.parquet`
pub fn partition_path(
    root: &Path,
    day: NaiveDate,
    company: &str,
    date_min: NaiveDate,
    date_max: NaiveDate,
) -> PathBuf {
    root.join(day_label(day)).join(format!(
        "{}_{}_{}.parquet",
        sanitize_label(company),
        date_min,
        date_max
    ))
}

#[derive(Debug, Clone)]
pub struct PartitionFile {
    pub path: PathBuf,
    pub rows: usize,
}

/// Materialize records as one parquet partition file, overwriting any
/// previous file at the same path. Zero records still produce a file, so the
/// landing area distinguishes "attempted, empty" from "not yet attempted".
pub fn write_partition(records: &[ComplaintRecord], path: &Path) -> Result<PartitionFile> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating landing directory {}", parent.display()))?;
    }

    let batch = complaint_batch(records)?;
    let file =
        File::create(path).with_context(|| format!("creating partition {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;

    Ok(PartitionFile {
        path: path.to_path_buf(),
        rows: records.len(),
    })
}

fn complaint_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ArrowField::new("complaint_id", DataType::Utf8, false),
        ArrowField::new("date_received", DataType::Date32, true),
        ArrowField::new("company", DataType::Utf8, true),
        ArrowField::new("product", DataType::Utf8, true),
        ArrowField::new("sub_product", DataType::Utf8, true),
        ArrowField::new("issue", DataType::Utf8, true),
        ArrowField::new("company_response", DataType::Utf8, true),
        ArrowField::new("is_timely_response", DataType::Boolean, true),
        ArrowField::new("state", DataType::Utf8, true),
        ArrowField::new("submitted_via", DataType::Utf8, true),
        ArrowField::new("consumer_consent_provided", DataType::Utf8, true),
        ArrowField::new(
            "_extracted_at",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        ),
    ]))
}

fn date32_days(day: NaiveDate) -> i32 {
    (day - NaiveDate::default()).num_days() as i32
}

fn complaint_batch(records: &[ComplaintRecord]) -> Result<RecordBatch> {
    let complaint_ids = StringArray::from(
        records
            .iter()
            .map(|r| r.complaint_id.as_str())
            .collect::<Vec<_>>(),
    );
    let dates_received = Date32Array::from(
        records
            .iter()
            .map(|r| r.date_received.map(date32_days))
            .collect::<Vec<_>>(),
    );
    let companies = StringArray::from(records.iter().map(|r| r.company.as_deref()).collect::<Vec<_>>());
    let products = StringArray::from(records.iter().map(|r| r.product.as_deref()).collect::<Vec<_>>());
    let sub_products = StringArray::from(
        records
            .iter()
            .map(|r| r.sub_product.as_deref())
            .collect::<Vec<_>>(),
    );
    let issues = StringArray::from(records.iter().map(|r| r.issue.as_deref()).collect::<Vec<_>>());
    let company_responses = StringArray::from(
        records
            .iter()
            .map(|r| r.company_response.as_deref())
            .collect::<Vec<_>>(),
    );
    let timely = BooleanArray::from(
        records
            .iter()
            .map(|r| r.is_timely_response)
            .collect::<Vec<_>>(),
    );
    let states = StringArray::from(records.iter().map(|r| r.state.as_deref()).collect::<Vec<_>>());
    let submitted_via = StringArray::from(
        records
            .iter()
            .map(|r| r.submitted_via.as_deref())
            .collect::<Vec<_>>(),
    );
    let consent = StringArray::from(
        records
            .iter()
            .map(|r| r.consumer_consent_provided.as_deref())
            .collect::<Vec<_>>(),
    );
    let extracted_at = TimestampMicrosecondArray::from(
        records
            .iter()
            .map(|r| r.extracted_at.timestamp_micros())
            .collect::<Vec<_>>(),
    );

    RecordBatch::try_new(
        complaint_schema(),
        vec![
            Arc::new(complaint_ids),
            Arc::new(dates_received),
            Arc::new(companies),
            Arc::new(products),
            Arc::new(sub_products),
            Arc::new(issues),
            Arc::new(company_responses),
            Arc::new(timely),
            Arc::new(states),
            Arc::new(submitted_via),
            Arc::new(consent),
            Arc::new(extracted_at),
        ],
    )
    .context("building complaint record batch")
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub file: PathBuf,
    pub rows_merged: usize,
    pub table_rows: usize,
}

/// Single-writer DuckDB warehouse. Merges are upserts keyed on
/// `complaint_id`: the most recently loaded row wins, so replaying a
/// partition refreshes `_extracted_at` and nothing else.
pub struct Warehouse {
    conn: Connection,
}

impl Warehouse {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening warehouse {}", path.display()))?;
        conn.execute_batch(WAREHOUSE_DDL)
            .context("creating warehouse schema")?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Upsert one landing partition into the warehouse table. A missing or
    /// malformed file surfaces as an error for this partition only; callers
    /// carry on with siblings.
    pub fn merge_partition(&self, file: &Path) -> Result<LoadSummary> {
        let literal = sql_path_literal(file)?;

        let rows_merged: i64 = self
            .conn
            .query_row(
                &format!("SELECT count(*) FROM read_parquet({literal})"),
                [],
                |row| row.get(0),
            )
            .with_context(|| format!("reading partition {}", file.display()))?;

        self.conn
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO {WAREHOUSE_TABLE} ({WAREHOUSE_COLUMNS}) \
                     SELECT {WAREHOUSE_COLUMNS} FROM read_parquet({literal})"
                ),
                [],
            )
            .with_context(|| format!("merging partition {}", file.display()))?;

        let table_rows: i64 = self
            .conn
            .query_row(&format!("SELECT count(*) FROM {WAREHOUSE_TABLE}"), [], |row| {
                row.get(0)
            })
            .context("counting warehouse rows")?;

        Ok(LoadSummary {
            file: file.to_path_buf(),
            rows_merged: rows_merged as usize,
            table_rows: table_rows as usize,
        })
    }
}

fn sql_path_literal(path: &Path) -> Result<String> {
    let text = path
        .to_str()
        .with_context(|| format!("partition path is not valid UTF-8: {}", path.display()))?;
    Ok(format!("'{}'", text.replace('\'', "''")))
}

#[derive(Debug, Clone)]
pub struct BackfillPlan {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub companies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PartitionOutcome {
    pub file: PathBuf,
    pub rows: usize,
}

/// One (day, company) cell of the backfill grid. The production runner
/// extracts, lands, and optionally merges; tests substitute stubs.
#[async_trait]
pub trait PartitionRunner: Send + Sync {
    async fn run_partition(&self, day: NaiveDate, company: &str) -> Result<PartitionOutcome>;
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionFailure {
    pub day: NaiveDate,
    pub company: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayResult {
    pub day: NaiveDate,
    pub files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_days: usize,
    pub total_files: usize,
    pub total_rows: usize,
    pub daily: Vec<DayResult>,
    pub failures: Vec<PartitionFailure>,
}

/// Walk the day × company grid in order. One company's failure is logged and
/// recorded but never halts the rest of the day; the summary is always
/// produced so partial completion stays visible.
pub async fn run_backfill(
    plan: &BackfillPlan,
    runner: &dyn PartitionRunner,
) -> Result<BackfillSummary> {
    anyhow::ensure!(
        plan.start <= plan.end,
        "start date {} is after end date {}",
        plan.start,
        plan.end
    );

    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let total_days = (plan.end - plan.start).num_days() as usize + 1;
    info!(
        %run_id,
        total_days,
        companies = plan.companies.len(),
        start = %plan.start,
        end = %plan.end,
        "starting backfill"
    );

    let mut total_files = 0usize;
    let mut total_rows = 0usize;
    let mut daily = Vec::with_capacity(total_days);
    let mut failures = Vec::new();

    let mut day = plan.start;
    loop {
        let mut day_files = 0usize;
        for company in &plan.companies {
            match runner.run_partition(day, company).await {
                Ok(outcome) => {
                    info!(%run_id, %day, company, rows = outcome.rows, file = %outcome.file.display(), "partition written");
                    day_files += 1;
                    total_files += 1;
                    total_rows += outcome.rows;
                }
                Err(err) => {
                    warn!(%run_id, %day, company, error = %err, "partition failed");
                    failures.push(PartitionFailure {
                        day,
                        company: company.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        daily.push(DayResult {
            day,
            files: day_files,
        });

        if day == plan.end {
            break;
        }
        day = day.succ_opt().context("backfill date range overflow")?;
    }

    let finished_at = Utc::now();
    info!(
        %run_id,
        total_days,
        total_files,
        total_rows,
        failed = failures.len(),
        "backfill complete"
    );

    Ok(BackfillSummary {
        run_id,
        started_at,
        finished_at,
        total_days,
        total_files,
        total_rows,
        daily,
        failures,
    })
}

/// Production partition runner: extract a one-day window for one company,
/// land it as parquet, and merge it into the warehouse when enabled.
pub struct PipelineRunner {
    config: PipelineConfig,
}

impl PipelineRunner {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PartitionRunner for PipelineRunner {
    async fn run_partition(&self, day: NaiveDate, company: &str) -> Result<PartitionOutcome> {
        let date_min = day;
        // Upper bound is the next day, matching the landing file layout.
        let date_max = day.succ_opt().context("backfill day out of range")?;

        let client = CfpbClient::new(ClientConfig {
            user_agent: self.config.user_agent.clone(),
            timeout: Duration::from_secs(self.config.http_timeout_secs),
            ..ClientConfig::default()
        })?;
        let query = ComplaintQuery::new()
            .with_window(date_min, date_max)
            .for_company(company);

        let records = ComplaintStream::new(client, query, None)
            .collect()
            .await
            .with_context(|| format!("extracting {company} for {day}"))?;

        let path = partition_path(&self.config.landing_root, day, company, date_min, date_max);
        let partition = write_partition(&records, &path)?;

        if self.config.merge_enabled {
            let warehouse = Warehouse::open(&self.config.database_path)?;
            let summary = warehouse.merge_partition(&partition.path)?;
            info!(
                rows = summary.rows_merged,
                table_rows = summary.table_rows,
                file = %summary.file.display(),
                "merged partition"
            );
        }

        Ok(PartitionOutcome {
            file: partition.path,
            rows: partition.rows,
        })
    }
}
