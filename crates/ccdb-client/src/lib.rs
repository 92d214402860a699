//! CFPB Consumer Complaint Database search client.
//!
//! Wraps the public search endpoint: query construction, retry with capped
//! exponential backoff, and normalization of the two response shapes the API
//! has been observed to return (a flat hit list, or a nested `hits` envelope
//! with a total count).

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info_span, warn};

pub const CRATE_NAME: &str = "ccdb-client";

pub const DEFAULT_BASE_URL: &str =
    "https://www.consumerfinance.gov/data-research/consumer-complaints/search/api/v1/";

/// Hard per-call maximum enforced by the API; larger requests are clamped.
pub const MAX_PAGE_SIZE: usize = 10_000;

/// The endpoint rejects default or missing user agents with an access-denied
/// response, so a descriptive identifier is always sent.
pub const DEFAULT_USER_AGENT: &str = "ccdb-pipeline/0.1 (complaint analytics ETL)";

const DEFAULT_SORT: &str = "created_date_desc";

/// One search call against the complaint endpoint.
#[derive(Debug, Clone)]
pub struct ComplaintQuery {
    pub date_received_min: Option<NaiveDate>,
    pub date_received_max: Option<NaiveDate>,
    pub size: usize,
    pub frm: usize,
    pub sort: String,
    pub search_term: Option<String>,
    pub search_field: Option<String>,
    pub no_aggs: bool,
    /// Arbitrary pass-through filters (`company`, `product`, `state`, ...).
    pub filters: Vec<(String, String)>,
}

impl Default for ComplaintQuery {
    fn default() -> Self {
        Self {
            date_received_min: None,
            date_received_max: None,
            size: MAX_PAGE_SIZE,
            frm: 0,
            sort: DEFAULT_SORT.to_string(),
            search_term: None,
            search_field: None,
            no_aggs: false,
            filters: Vec::new(),
        }
    }
}

impl ComplaintQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(mut self, date_min: NaiveDate, date_max: NaiveDate) -> Self {
        self.date_received_min = Some(date_min);
        self.date_received_max = Some(date_max);
        self
    }

    /// Scope the search to one company name; aggregations are disabled for
    /// faster responses on scoped queries.
    pub fn for_company(mut self, company: &str) -> Self {
        self.search_term = Some(company.to_string());
        self.search_field = Some("company".to_string());
        self.no_aggs = true;
        self
    }

    pub fn with_filter(mut self, key: &str, value: &str) -> Self {
        self.filters.push((key.to_string(), value.to_string()));
        self
    }

    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("size".to_string(), self.size.min(MAX_PAGE_SIZE).to_string()),
            ("frm".to_string(), self.frm.to_string()),
            ("sort".to_string(), self.sort.clone()),
            ("format".to_string(), "json".to_string()),
        ];
        if let Some(date_min) = self.date_received_min {
            params.push(("date_received_min".to_string(), date_min.to_string()));
        }
        if let Some(date_max) = self.date_received_max {
            params.push(("date_received_max".to_string(), date_max.to_string()));
        }
        if let Some(field) = &self.search_field {
            params.push(("field".to_string(), field.clone()));
        }
        if let Some(term) = &self.search_term {
            params.push(("search_term".to_string(), term.clone()));
        }
        if self.no_aggs {
            params.push(("no_aggs".to_string(), "true".to_string()));
        }
        params.extend(self.filters.iter().cloned());
        params
    }
}

/// Raw response, resolved once at the deserialization boundary.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SearchResponse {
    Nested { hits: HitsEnvelope },
    Flat(Vec<Hit>),
}

#[derive(Debug, Deserialize)]
pub struct HitsEnvelope {
    #[serde(default)]
    pub hits: Vec<Hit>,
    #[serde(default)]
    pub total: Option<TotalCount>,
}

#[derive(Debug, Deserialize)]
pub struct Hit {
    #[serde(rename = "_source", default)]
    pub source: Map<String, Value>,
}

/// The total count is a scalar in older responses, `{value: n}` in newer ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TotalCount {
    Scalar(u64),
    Object { value: u64 },
}

/// One normalized page: hit sources plus the reported total.
#[derive(Debug, Default)]
pub struct Page {
    pub records: Vec<Map<String, Value>>,
    pub total_available: u64,
}

impl SearchResponse {
    pub fn normalize(self) -> Page {
        match self {
            // The flat shape carries no total; the page itself is all we know.
            SearchResponse::Flat(hits) => {
                let total_available = hits.len() as u64;
                Page {
                    records: hits.into_iter().map(|h| h.source).collect(),
                    total_available,
                }
            }
            SearchResponse::Nested { hits } => {
                let total_available = match hits.total {
                    Some(TotalCount::Scalar(v)) => v,
                    Some(TotalCount::Object { value }) => value,
                    None => 0,
                };
                Page {
                    records: hits.hits.into_iter().map(|h| h.source).collect(),
                    total_available,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 429 and transient server errors are retried; other client errors surface
/// immediately. Only idempotent GETs pass through this client.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Seam between the pipeline and the remote endpoint; stubbed in tests.
#[async_trait]
pub trait ComplaintSearch: Send + Sync {
    async fn search(&self, query: &ComplaintQuery) -> Result<Page, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Owned HTTP session with connection pooling; dropped when the extraction
/// that owns it completes.
#[derive(Debug)]
pub struct CfpbClient {
    http: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl CfpbClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            http,
            base_url: config.base_url,
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl ComplaintSearch for CfpbClient {
    async fn search(&self, query: &ComplaintQuery) -> Result<Page, FetchError> {
        let span = info_span!("cfpb_search", frm = query.frm, size = query.size);
        let _guard = span.enter();

        let params = query.to_params();
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.http.get(&self.base_url).query(&params).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return match serde_json::from_slice::<SearchResponse>(&body) {
                            Ok(parsed) => Ok(parsed.normalize()),
                            Err(err) => {
                                // The remote shape has been observed to vary;
                                // an unrecognized body counts as an empty page.
                                warn!(error = %err, url = %final_url, "unexpected response shape");
                                Ok(Page::default())
                            }
                        };
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

/// Accumulate every page for a query, advancing `frm` by the page size.
///
/// Termination policy: a page with zero records is the authoritative stop
/// signal; reaching the reported total is a fast path; `max_records` is a
/// caller-supplied cap checked before each request. A total that shrinks
/// between pages therefore costs at most one extra (empty) request and can
/// never loop. Memory is unbounded for wide windows, which is why callers
/// partition by day.
pub async fn fetch_all<A: ComplaintSearch>(
    api: &A,
    query: &ComplaintQuery,
    max_records: Option<usize>,
) -> Result<Vec<Map<String, Value>>, FetchError> {
    let mut all_records = Vec::new();
    let mut page_query = query.clone();
    page_query.frm = 0;

    loop {
        if let Some(cap) = max_records {
            if all_records.len() >= cap {
                break;
            }
        }

        let page = api.search(&page_query).await?;
        if page.records.is_empty() {
            break;
        }

        let total_available = page.total_available;
        all_records.extend(page.records);

        if total_available > 0 && all_records.len() as u64 >= total_available {
            break;
        }

        page_query.frm += page_query.size.min(MAX_PAGE_SIZE);
    }

    Ok(all_records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn source(id: usize) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("complaint_id".to_string(), Value::String(format!("c-{id}")));
        map
    }

    fn page(rows: usize, total_available: u64) -> Page {
        Page {
            records: (0..rows).map(source).collect(),
            total_available,
        }
    }

    struct StubSearch {
        pages: Mutex<Vec<Page>>,
        calls: AtomicUsize,
    }

    impl StubSearch {
        fn new(pages: Vec<Page>) -> Self {
            Self {
                pages: Mutex::new(pages),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ComplaintSearch for StubSearch {
        async fn search(&self, _query: &ComplaintQuery) -> Result<Page, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut pages = self.pages.lock().expect("stub lock");
            if pages.is_empty() {
                Ok(Page::default())
            } else {
                Ok(pages.remove(0))
            }
        }
    }

    #[test]
    fn nested_shape_with_object_total_normalizes() {
        let body = r#"{"hits": {"hits": [{"_id": "x", "_source": {"company": "Acme"}}], "total": {"value": 42}}}"#;
        let page = serde_json::from_str::<SearchResponse>(body)
            .expect("nested shape parses")
            .normalize();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.total_available, 42);
        assert_eq!(page.records[0]["company"], "Acme");
    }

    #[test]
    fn nested_shape_with_scalar_total_normalizes() {
        let body = r#"{"hits": {"hits": [], "total": 7}}"#;
        let page = serde_json::from_str::<SearchResponse>(body)
            .expect("nested shape parses")
            .normalize();
        assert!(page.records.is_empty());
        assert_eq!(page.total_available, 7);
    }

    #[test]
    fn flat_shape_normalizes_with_page_length_total() {
        let body = r#"[{"_source": {"company": "Acme"}}, {"_source": {"company": "Bolt"}}]"#;
        let page = serde_json::from_str::<SearchResponse>(body)
            .expect("flat shape parses")
            .normalize();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.total_available, 2);
    }

    #[test]
    fn unrecognized_shape_fails_deserialization() {
        let body = r#"{"unexpected": true}"#;
        assert!(serde_json::from_str::<SearchResponse>(body).is_err());
    }

    #[test]
    fn page_size_is_clamped_and_company_scope_applied() {
        let query = ComplaintQuery {
            size: 50_000,
            ..ComplaintQuery::new()
        }
        .for_company("JPMorgan Chase");
        let params = query.to_params();
        assert!(params.contains(&("size".to_string(), "10000".to_string())));
        assert!(params.contains(&("field".to_string(), "company".to_string())));
        assert!(params.contains(&("search_term".to_string(), "JPMorgan Chase".to_string())));
        assert!(params.contains(&("no_aggs".to_string(), "true".to_string())));
        assert!(params.contains(&("format".to_string(), "json".to_string())));
    }

    #[test]
    fn pass_through_filters_are_appended_verbatim() {
        let query = ComplaintQuery::new()
            .with_filter("product", "Credit card")
            .with_filter("state", "NY");
        let params = query.to_params();
        assert!(params.contains(&("product".to_string(), "Credit card".to_string())));
        assert!(params.contains(&("state".to_string(), "NY".to_string())));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn pagination_stops_at_reported_total() {
        let stub = StubSearch::new(vec![page(100, 250), page(100, 250), page(50, 250)]);
        let query = ComplaintQuery {
            size: 100,
            ..ComplaintQuery::new()
        };

        let records = fetch_all(&stub, &query, None).await.expect("fetch_all");
        assert_eq!(records.len(), 250);
        assert_eq!(stub.call_count(), 3);
    }

    #[tokio::test]
    async fn empty_first_page_ends_pagination() {
        let stub = StubSearch::new(vec![]);
        let query = ComplaintQuery::new();

        let records = fetch_all(&stub, &query, None).await.expect("fetch_all");
        assert!(records.is_empty());
        assert_eq!(stub.call_count(), 1);
    }

    #[tokio::test]
    async fn max_records_cap_stops_before_next_request() {
        let stub = StubSearch::new(vec![page(100, 1_000), page(100, 1_000)]);
        let query = ComplaintQuery {
            size: 100,
            ..ComplaintQuery::new()
        };

        let records = fetch_all(&stub, &query, Some(100)).await.expect("fetch_all");
        assert_eq!(records.len(), 100);
        assert_eq!(stub.call_count(), 1);
    }

    #[tokio::test]
    async fn shrinking_total_terminates_on_empty_page() {
        // Total claims 300 but the source dries up after 150 records.
        let stub = StubSearch::new(vec![page(100, 300), page(50, 300)]);
        let query = ComplaintQuery {
            size: 100,
            ..ComplaintQuery::new()
        };

        let records = fetch_all(&stub, &query, None).await.expect("fetch_all");
        assert_eq!(records.len(), 150);
        assert_eq!(stub.call_count(), 3);
    }
}
