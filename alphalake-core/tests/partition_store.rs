//! Integration tests for the partition writer.
//!
//! Tests:
//! 1. Committing the same rows twice yields identical logical content
//! 2. A crash mid-encode leaves the previous partition byte-for-byte intact
//! 3. Rows are written in key order regardless of input order
//! 4. Writing one partition never touches a sibling year
//! 5. Codes with path separators stay inside their partition directory

use chrono::NaiveDate;
use std::fs;
use std::io::Write;
use std::sync::Arc;

use alphalake_core::data::store::rows_to_dataframe;
use alphalake_core::data::{DataError, PartitionEncoder, PartitionWriter};
use alphalake_core::domain::{
    content_hash, Adjust, CanonicalRow, DataType, Dataset, PartitionKey, PriceFields, RowBody,
};

// ── Helpers ──────────────────────────────────────────────────────────

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn bar(code: &str, date: NaiveDate, close: f64) -> CanonicalRow {
    CanonicalRow {
        code: code.into(),
        date,
        item: None,
        source: "eastmoney".into(),
        body: RowBody::Price(PriceFields {
            open: Some(close),
            high: Some(close),
            low: Some(close),
            close: Some(close),
            adjust: Adjust::Back,
            ..Default::default()
        }),
    }
}

/// Writes a few bytes of garbage, then fails, like a process killed mid-write.
struct CrashingEncoder;

impl PartitionEncoder for CrashingEncoder {
    fn encode(&self, _: DataType, _: &[CanonicalRow], file: &mut fs::File) -> Result<(), DataError> {
        let _ = file.write_all(b"PAR1 partial");
        Err(DataError::Other("simulated crash".into()))
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[test]
fn commit_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let writer = PartitionWriter::new(dir.path());
    let ds = Dataset::stock_price();
    let rows = vec![
        bar("sh.600519", d(2024, 1, 2), 1690.0),
        bar("sh.600519", d(2024, 1, 3), 1695.0),
    ];

    let first = writer.commit(&ds, "sh.600519", PartitionKey(2024), &rows).unwrap();
    let read_first = writer.read(&ds, "sh.600519", PartitionKey(2024)).unwrap().unwrap();
    let second = writer.commit(&ds, "sh.600519", PartitionKey(2024), &rows).unwrap();
    let read_second = writer.read(&ds, "sh.600519", PartitionKey(2024)).unwrap().unwrap();

    assert_eq!(first.content_hash, second.content_hash);
    assert_eq!(read_first, read_second);
    assert_eq!(content_hash(&read_second), second.content_hash);
}

#[test]
fn failed_commit_keeps_previous_partition() {
    let dir = tempfile::tempdir().unwrap();
    let ds = Dataset::stock_price();
    let good = PartitionWriter::new(dir.path());
    let original = vec![bar("sh.600519", d(2024, 1, 2), 1690.0)];
    let receipt = good.commit(&ds, "sh.600519", PartitionKey(2024), &original).unwrap();
    let bytes_before = fs::read(&receipt.path).unwrap();

    let crashing = PartitionWriter::with_encoder(dir.path(), Arc::new(CrashingEncoder));
    let replacement = vec![bar("sh.600519", d(2024, 1, 2), 9999.0)];
    let err = crashing
        .commit(&ds, "sh.600519", PartitionKey(2024), &replacement)
        .unwrap_err();
    assert!(matches!(err, DataError::WriteFailure { .. }));

    assert_eq!(fs::read(&receipt.path).unwrap(), bytes_before);
    let partition_dir = receipt.path.parent().unwrap();
    let leftovers: Vec<_> = fs::read_dir(partition_dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(leftovers, vec!["sh.600519.parquet".to_string()]);

    let rows = good.read(&ds, "sh.600519", PartitionKey(2024)).unwrap().unwrap();
    assert_eq!(rows, original);
}

#[test]
fn failed_first_commit_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let ds = Dataset::etf_price();
    let crashing = PartitionWriter::with_encoder(dir.path(), Arc::new(CrashingEncoder));
    let rows = vec![bar("sh.510300", d(2024, 3, 1), 3.5)];
    assert!(crashing.commit(&ds, "sh.510300", PartitionKey(2024), &rows).is_err());

    let path = crashing.partition_path(&ds, "sh.510300", PartitionKey(2024));
    assert!(!path.exists());
    assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 0);
}

#[test]
fn rows_written_in_key_order() {
    let dir = tempfile::tempdir().unwrap();
    let writer = PartitionWriter::new(dir.path());
    let ds = Dataset::index_price();
    let rows = vec![
        bar("sh.000001", d(2024, 3, 1), 3.0),
        bar("sh.000001", d(2024, 1, 2), 1.0),
        bar("sh.000001", d(2024, 2, 1), 2.0),
    ];
    writer.commit(&ds, "sh.000001", PartitionKey(2024), &rows).unwrap();

    let back = writer.read(&ds, "sh.000001", PartitionKey(2024)).unwrap().unwrap();
    let dates: Vec<_> = back.iter().map(|r| r.date).collect();
    assert_eq!(dates, vec![d(2024, 1, 2), d(2024, 2, 1), d(2024, 3, 1)]);
}

#[test]
fn sibling_year_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let writer = PartitionWriter::new(dir.path());
    let ds = Dataset::stock_price();
    let old = writer
        .commit(&ds, "sh.600519", PartitionKey(2024), &[bar("sh.600519", d(2024, 12, 31), 1.0)])
        .unwrap();
    let before = fs::read(&old.path).unwrap();
    let modified_before = fs::metadata(&old.path).unwrap().modified().unwrap();

    writer
        .commit(&ds, "sh.600519", PartitionKey(2025), &[bar("sh.600519", d(2025, 1, 2), 2.0)])
        .unwrap();

    assert_eq!(fs::read(&old.path).unwrap(), before);
    assert_eq!(fs::metadata(&old.path).unwrap().modified().unwrap(), modified_before);
}

#[test]
fn odd_codes_stay_inside_partition_dir() {
    let dir = tempfile::tempdir().unwrap();
    let writer = PartitionWriter::new(dir.path());
    let ds = Dataset::alt("industry_pe");
    let path = writer.partition_path(&ds, "../escape/x", PartitionKey(2024));
    assert_eq!(path.parent().unwrap(), dir.path().join("alt_industry_pe").join("year=2024"));
    assert_eq!(path.file_name().unwrap(), ".._escape_x.parquet");
}

#[test]
fn dataframe_columns_follow_schema() {
    let rows = vec![bar("sh.600519", d(2024, 1, 2), 1.0)];
    let df = rows_to_dataframe(DataType::PriceDaily, &rows).unwrap();
    let names: Vec<String> = df.get_column_names().iter().map(|n| n.to_string()).collect();
    assert_eq!(names.first().map(String::as_str), Some("code"));
    assert_eq!(names.get(1).map(String::as_str), Some("date"));
    assert!(names.contains(&"adjust_gap".to_string()));
    assert_eq!(df.height(), 1);
}
