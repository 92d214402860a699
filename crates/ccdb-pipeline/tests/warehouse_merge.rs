//! Warehouse merge semantics: keyed upsert, idempotent replays, and
//! per-partition failure isolation.

use ccdb_core::ComplaintRecord;
use ccdb_pipeline::{write_partition, Warehouse, WAREHOUSE_TABLE};
use chrono::{NaiveDate, TimeZone, Utc};
use duckdb::params;
use std::path::Path;

fn record(id: &str, company_response: &str) -> ComplaintRecord {
    ComplaintRecord {
        complaint_id: id.to_string(),
        date_received: NaiveDate::from_ymd_opt(2026, 1, 5),
        company: Some("Acme Bank".to_string()),
        product: Some("Credit card".to_string()),
        sub_product: None,
        issue: Some("Billing dispute".to_string()),
        company_response: Some(company_response.to_string()),
        is_timely_response: Some(true),
        state: Some("NY".to_string()),
        submitted_via: Some("Web".to_string()),
        consumer_consent_provided: None,
        extracted_at: Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).single().unwrap(),
    }
}

fn table_rows(warehouse: &Warehouse) -> i64 {
    warehouse
        .connection()
        .query_row(&format!("SELECT count(*) FROM {WAREHOUSE_TABLE}"), [], |row| row.get(0))
        .expect("count rows")
}

fn company_response(warehouse: &Warehouse, id: &str) -> Option<String> {
    warehouse
        .connection()
        .query_row(
            &format!("SELECT company_response FROM {WAREHOUSE_TABLE} WHERE complaint_id = ?"),
            params![id],
            |row| row.get(0),
        )
        .expect("lookup company_response")
}

#[test]
fn merging_the_same_partition_twice_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let partition = dir.path().join("acme_2026-01-05_2026-01-06.parquet");
    write_partition(
        &[record("a-1", "Closed"), record("a-2", "In progress")],
        &partition,
    )
    .expect("write partition");

    let warehouse = Warehouse::open(&dir.path().join("warehouse.duckdb")).expect("open warehouse");

    let first = warehouse.merge_partition(&partition).expect("first merge");
    assert_eq!(first.rows_merged, 2);
    assert_eq!(first.table_rows, 2);

    let second = warehouse.merge_partition(&partition).expect("second merge");
    assert_eq!(second.rows_merged, 2);
    assert_eq!(second.table_rows, 2);

    assert_eq!(table_rows(&warehouse), 2);
    assert_eq!(company_response(&warehouse, "a-1").as_deref(), Some("Closed"));
    assert_eq!(
        company_response(&warehouse, "a-2").as_deref(),
        Some("In progress")
    );
}

#[test]
fn later_partition_wins_on_conflicting_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first = dir.path().join("day1.parquet");
    let second = dir.path().join("day2.parquet");
    write_partition(&[record("dup", "Closed with explanation")], &first).expect("write first");
    write_partition(
        &[record("dup", "Closed with monetary relief")],
        &second,
    )
    .expect("write second");

    let warehouse = Warehouse::open(&dir.path().join("warehouse.duckdb")).expect("open warehouse");
    warehouse.merge_partition(&first).expect("merge first");
    warehouse.merge_partition(&second).expect("merge second");

    assert_eq!(table_rows(&warehouse), 1);
    assert_eq!(
        company_response(&warehouse, "dup").as_deref(),
        Some("Closed with monetary relief")
    );
}

#[test]
fn empty_partition_merges_as_a_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    let partition = dir.path().join("empty.parquet");
    write_partition(&[], &partition).expect("write empty partition");

    let warehouse = Warehouse::open(&dir.path().join("warehouse.duckdb")).expect("open warehouse");
    let summary = warehouse.merge_partition(&partition).expect("merge empty");
    assert_eq!(summary.rows_merged, 0);
    assert_eq!(summary.table_rows, 0);
}

#[test]
fn missing_partition_file_is_a_load_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let warehouse = Warehouse::open(&dir.path().join("warehouse.duckdb")).expect("open warehouse");

    let result = warehouse.merge_partition(Path::new("does/not/exist.parquet"));
    assert!(result.is_err());

    // The warehouse stays usable for sibling partitions.
    let partition = dir.path().join("ok.parquet");
    write_partition(&[record("b-1", "Closed")], &partition).expect("write partition");
    warehouse.merge_partition(&partition).expect("merge sibling");
    assert_eq!(table_rows(&warehouse), 1);
}
