//! Core domain model and identity resolution for the complaint pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "ccdb-core";

/// Identity fields checked in order before falling back to a derived key.
const ID_FIELDS: [&str; 3] = ["_id", "id", "complaint_id"];

/// Length of the hex digest suffix in fallback complaint ids.
const FALLBACK_DIGEST_LEN: usize = 8;

/// One consumer complaint as persisted in landing files and the warehouse.
///
/// `complaint_id` is assigned once at extraction time and never mutated;
/// `extracted_at` is a batch-level provenance stamp shared by every record
/// of one extraction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplaintRecord {
    pub complaint_id: String,
    pub date_received: Option<NaiveDate>,
    pub company: Option<String>,
    pub product: Option<String>,
    pub sub_product: Option<String>,
    pub issue: Option<String>,
    pub company_response: Option<String>,
    pub is_timely_response: Option<bool>,
    pub state: Option<String>,
    pub submitted_via: Option<String>,
    pub consumer_consent_provided: Option<String>,
    pub extracted_at: DateTime<Utc>,
}

impl ComplaintRecord {
    /// Build a record from a raw API source object plus a resolved identity
    /// and the extraction batch timestamp.
    pub fn from_source(
        raw: &Map<String, Value>,
        complaint_id: String,
        extracted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            complaint_id,
            date_received: raw
                .get("date_received")
                .and_then(Value::as_str)
                .and_then(parse_received_date),
            company: str_field(raw, "company"),
            product: str_field(raw, "product"),
            sub_product: str_field(raw, "sub_product"),
            issue: str_field(raw, "issue"),
            company_response: str_field(raw, "company_response"),
            is_timely_response: str_field(raw, "timely").and_then(|v| match v.as_str() {
                "Yes" => Some(true),
                "No" => Some(false),
                _ => None,
            }),
            state: str_field(raw, "state"),
            submitted_via: str_field(raw, "submitted_via"),
            consumer_consent_provided: str_field(raw, "consumer_consent_provided"),
            extracted_at,
        }
    }
}

/// Assign a stable `complaint_id` to a raw record.
///
/// Prefers a source-supplied identifier (`_id`, then `id`, then
/// `complaint_id`), stringified verbatim. Records without one get
/// `<date_received>_<8-hex>` over a sorted serialization of all fields.
/// The fallback is deterministic but only best-effort unique: two records
/// sharing every field collapse to the same id. Warehouse dedup continuity
/// depends on this exact scheme, so it stays as-is.
pub fn resolve_complaint_id(raw: &Map<String, Value>) -> String {
    for key in ID_FIELDS {
        if let Some(id) = raw.get(key).and_then(stringify_id) {
            if !id.is_empty() {
                return id;
            }
        }
    }

    let date_received = raw
        .get("date_received")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let digest = content_digest(raw);
    format!("{date_received}_{}", &digest[..FALLBACK_DIGEST_LEN])
}

fn stringify_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Hex digest over the record's key/value pairs in sorted key order.
fn content_digest(raw: &Map<String, Value>) -> String {
    let sorted: BTreeMap<&String, &Value> = raw.iter().collect();
    let mut hasher = Sha256::new();
    for (key, value) in sorted {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.to_string().as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

fn str_field(raw: &Map<String, Value>, key: &str) -> Option<String> {
    raw.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The API returns dates either bare (`2026-01-05`) or with a time suffix.
fn parse_received_date(value: &str) -> Option<NaiveDate> {
    let day = value.get(..10).unwrap_or(value);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// Reduce a label to lowercase alphanumerics and single underscores, for
/// filesystem-safe, collision-free partition names.
pub fn sanitize_label(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_separator = false;
    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(c);
        } else {
            pending_separator = true;
        }
    }
    out
}

/// Directory label for one landing day, e.g. `2026_01_05`.
pub fn day_label(day: NaiveDate) -> String {
    day.format("%Y_%m_%d").to_string()
}
