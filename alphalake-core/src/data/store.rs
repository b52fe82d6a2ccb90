//! Partitioned Parquet store.
//!
//! Layout: `{root}/{dataset}/year={YYYY}/{file_stem(code)}.parquet`
//!
//! - One file per (dataset, asset, year); a commit replaces the whole file
//! - Atomic replace: hidden unique temp file in the target directory, fsync,
//!   rename over the target, fsync the directory
//! - A failed commit leaves the previous file byte-for-byte intact
//! - Corrupt files are quarantined on read (`{file}.quarantined`)
//! - Partitions are never deleted

use super::provider::DataError;
use super::schema::{self, FINANCIAL_COLUMNS, PRICE_VALUE_COLUMNS};
use crate::domain::{
    content_hash, file_stem, Adjust, AltFields, CanonicalRow, DataType, Dataset, FinancialFields,
    PartitionKey, PriceFields, RowBody,
};
use chrono::NaiveDate;
use polars::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const PARQUET_EXT: &str = "parquet";
const QUARANTINE_SUFFIX: &str = "quarantined";
const TEMP_SUFFIX: &str = ".tmp";

/// Proof of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReceipt {
    pub path: PathBuf,
    pub rows: usize,
    /// BLAKE3 digest of the committed logical rows.
    pub content_hash: String,
}

/// Serializes a partition's rows into an open file.
///
/// The default is [`ParquetEncoder`]. Tests substitute encoders that fail
/// part-way to exercise the atomic-replace path.
pub trait PartitionEncoder: Send + Sync {
    fn encode(&self, data_type: DataType, rows: &[CanonicalRow], file: &mut fs::File) -> Result<(), DataError>;
}

/// Snappy-compressed Parquet via polars.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetEncoder;

impl PartitionEncoder for ParquetEncoder {
    fn encode(&self, data_type: DataType, rows: &[CanonicalRow], file: &mut fs::File) -> Result<(), DataError> {
        let mut df = rows_to_dataframe(data_type, rows)?;
        ParquetWriter::new(file)
            .with_compression(ParquetCompression::Snappy)
            .finish(&mut df)
            .map_err(|e| DataError::Other(format!("write parquet: {e}")))?;
        Ok(())
    }
}

/// Partition count and size of one year directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    pub key: PartitionKey,
    pub files: usize,
    pub bytes: u64,
}

/// Summary of one dataset directory, for `lake status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetStats {
    pub name: String,
    pub partitions: usize,
    pub files: usize,
    pub bytes: u64,
    pub first_year: Option<i32>,
    pub last_year: Option<i32>,
    pub quarantined: usize,
}

pub struct PartitionWriter {
    root: PathBuf,
    encoder: Arc<dyn PartitionEncoder>,
}

impl PartitionWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_encoder(root, Arc::new(ParquetEncoder))
    }

    pub fn with_encoder(root: impl Into<PathBuf>, encoder: Arc<dyn PartitionEncoder>) -> Self {
        Self {
            root: root.into(),
            encoder,
        }
    }

    /// Lake root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_dir(&self, dataset: &Dataset) -> PathBuf {
        self.root.join(dataset.name())
    }

    pub fn partition_dir(&self, dataset: &Dataset, key: PartitionKey) -> PathBuf {
        self.dataset_dir(dataset).join(key.dir_name())
    }

    pub fn partition_path(&self, dataset: &Dataset, code: &str, key: PartitionKey) -> PathBuf {
        self.partition_dir(dataset, key)
            .join(format!("{}.{PARQUET_EXT}", file_stem(code)))
    }

    /// Atomically replace the partition `(dataset, code, key)` with `rows`.
    ///
    /// Rows are written in key order. Every row must belong to `code` and
    /// `key` and carry a body of the dataset's data type, and keys must be
    /// unique; otherwise nothing is written. An empty row set is refused.
    pub fn commit(
        &self,
        dataset: &Dataset,
        code: &str,
        key: PartitionKey,
        rows: &[CanonicalRow],
    ) -> Result<CommitReceipt, DataError> {
        let path = self.partition_path(dataset, code, key);
        let fail = |reason: String| DataError::WriteFailure {
            path: path.display().to_string(),
            reason,
        };

        if rows.is_empty() {
            return Err(fail("refusing to commit an empty partition".into()));
        }
        for row in rows {
            if row.code != code || row.partition_key() != key {
                return Err(fail(format!(
                    "row ({}, {}) does not belong to ({code}, {key})",
                    row.code, row.date
                )));
            }
            if !body_matches(dataset.data_type(), &row.body) {
                return Err(fail(format!(
                    "row for {} is not a {} row",
                    row.date,
                    dataset.data_type()
                )));
            }
        }

        let mut sorted = rows.to_vec();
        sorted.sort_by_key(|r| r.key());
        if let Some(pair) = sorted.windows(2).find(|w| w[0].key() == w[1].key()) {
            return Err(fail(format!("duplicate key for {}", pair[1].date)));
        }

        let dir = self.partition_dir(dataset, key);
        fs::create_dir_all(&dir).map_err(|e| fail(format!("create dir: {e}")))?;
        sweep_temp_files(&dir, &file_stem(code));

        let tmp = dir.join(format!(
            ".{}.{PARQUET_EXT}.{:016x}{TEMP_SUFFIX}",
            file_stem(code),
            rand::random::<u64>()
        ));

        if let Err(e) = self.write_and_sync(dataset.data_type(), &sorted, &tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(fail(e.to_string()));
        }

        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(fail(format!("atomic rename failed: {e}")));
        }
        if let Err(e) = sync_dir(&dir) {
            warn!(dir = %dir.display(), error = %e, "directory fsync failed after rename");
        }

        let receipt = CommitReceipt {
            path,
            rows: sorted.len(),
            content_hash: content_hash(&sorted),
        };
        debug!(
            dataset = %dataset,
            code,
            partition = %key,
            rows = receipt.rows,
            "partition committed"
        );
        Ok(receipt)
    }

    fn write_and_sync(&self, data_type: DataType, rows: &[CanonicalRow], tmp: &Path) -> Result<(), DataError> {
        let mut file = fs::File::create(tmp).map_err(|e| DataError::Other(format!("create temp file: {e}")))?;
        self.encoder.encode(data_type, rows, &mut file)?;
        file.sync_all()
            .map_err(|e| DataError::Other(format!("fsync temp file: {e}")))
    }

    /// Decode a partition. `Ok(None)` when it has never been written.
    ///
    /// A file that fails to decode or validate is renamed to
    /// `{file}.quarantined` and reported as `ReadFailure`.
    pub fn read(
        &self,
        dataset: &Dataset,
        code: &str,
        key: PartitionKey,
    ) -> Result<Option<Vec<CanonicalRow>>, DataError> {
        let path = self.partition_path(dataset, code, key);
        if !path.exists() {
            return Ok(None);
        }

        match read_partition(&path, dataset.data_type()) {
            Ok(rows) => Ok(Some(rows)),
            Err(e) => {
                let quarantine = path.with_extension(format!("{PARQUET_EXT}.{QUARANTINE_SUFFIX}"));
                warn!(
                    path = %path.display(),
                    error = %e,
                    "quarantining corrupt partition file"
                );
                let _ = fs::rename(&path, &quarantine);
                Err(DataError::ReadFailure {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Year partitions of a dataset, ascending.
    pub fn list_partitions(&self, dataset: &Dataset) -> Result<Vec<PartitionInfo>, DataError> {
        list_year_dirs(&self.dataset_dir(dataset))
    }

    /// Per-dataset summary of everything under the lake root.
    pub fn stats(&self) -> Result<Vec<DatasetStats>, DataError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in read_dir_sorted(&self.root)? {
            if !entry.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            let partitions = list_year_dirs(&entry)?;
            let quarantined = partitions
                .iter()
                .map(|p| count_quarantined(&entry.join(p.key.dir_name())))
                .sum();
            out.push(DatasetStats {
                name,
                partitions: partitions.len(),
                files: partitions.iter().map(|p| p.files).sum(),
                bytes: partitions.iter().map(|p| p.bytes).sum(),
                first_year: partitions.first().map(|p| p.key.year()),
                last_year: partitions.last().map(|p| p.key.year()),
                quarantined,
            });
        }
        Ok(out)
    }
}

fn body_matches(data_type: DataType, body: &RowBody) -> bool {
    matches!(
        (data_type, body),
        (DataType::PriceDaily | DataType::ConceptIndex, RowBody::Price(_))
            | (DataType::FinancialReport, RowBody::Financial(_))
            | (DataType::AltData, RowBody::Alt(_))
    )
}

/// Remove temp files left behind for `stem` by an earlier crashed commit.
/// Returns how many were removed.
pub fn sweep_temp_files(dir: &Path, stem: &str) -> usize {
    let prefix = format!(".{stem}.{PARQUET_EXT}.");
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&prefix) && name.ends_with(TEMP_SUFFIX) && fs::remove_file(entry.path()).is_ok() {
            debug!(file = name, "removed stale temp file");
            removed += 1;
        }
    }
    removed
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, DataError> {
    let read_err = |e: io::Error| DataError::ReadFailure {
        path: dir.display().to_string(),
        reason: e.to_string(),
    };
    let mut paths = fs::read_dir(dir)
        .map_err(read_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?;
    paths.sort();
    Ok(paths)
}

fn list_year_dirs(dataset_dir: &Path) -> Result<Vec<PartitionInfo>, DataError> {
    if !dataset_dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for dir in read_dir_sorted(dataset_dir)? {
        let Some(key) = dir
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(PartitionKey::from_dir_name)
        else {
            continue;
        };
        let mut files = 0;
        let mut bytes = 0;
        for file in read_dir_sorted(&dir)? {
            if file.extension().and_then(|e| e.to_str()) == Some(PARQUET_EXT) {
                files += 1;
                bytes += fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
            }
        }
        out.push(PartitionInfo { key, files, bytes });
    }
    out.sort_by_key(|p| p.key);
    Ok(out)
}

fn count_quarantined(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| {
                    e.path().extension().and_then(|x| x.to_str()) == Some(QUARANTINE_SUFFIX)
                })
                .count()
        })
        .unwrap_or(0)
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn epoch() -> NaiveDate {
    NaiveDate::default()
}

fn encode_err(e: PolarsError) -> DataError {
    DataError::Other(format!("dataframe creation: {e}"))
}

/// Build the canonical DataFrame for a row set. Column order follows
/// [`schema::schema_for`].
pub fn rows_to_dataframe(data_type: DataType, rows: &[CanonicalRow]) -> Result<DataFrame, DataError> {
    let codes: Vec<&str> = rows.iter().map(|r| r.code.as_str()).collect();
    let days: Vec<i32> = rows
        .iter()
        .map(|r| (r.date - epoch()).num_days() as i32)
        .collect();
    let sources: Vec<&str> = rows.iter().map(|r| r.source.as_str()).collect();

    let mut columns = vec![
        Column::new("code".into(), codes),
        Column::new(schema::date_column(data_type).into(), days)
            .cast(&polars::prelude::DataType::Date)
            .map_err(encode_err)?,
    ];

    match data_type {
        DataType::PriceDaily | DataType::ConceptIndex => {
            let prices: Vec<&PriceFields> = rows
                .iter()
                .map(|r| {
                    r.price()
                        .ok_or_else(|| DataError::Other(format!("non-price row for {}", r.date)))
                })
                .collect::<Result<_, _>>()?;
            for name in PRICE_VALUE_COLUMNS {
                let values: Vec<Option<f64>> = prices.iter().map(|p| price_value(p, name)).collect();
                columns.push(Column::new((*name).into(), values));
            }
            let trade_status: Vec<Option<i32>> = prices.iter().map(|p| p.trade_status).collect();
            let is_st: Vec<Option<i32>> = prices.iter().map(|p| p.is_st).collect();
            let adjust: Vec<&str> = prices.iter().map(|p| p.adjust.as_str()).collect();
            let gap: Vec<bool> = prices.iter().map(|p| p.adjust_gap).collect();
            columns.push(Column::new("trade_status".into(), trade_status));
            columns.push(Column::new("is_st".into(), is_st));
            columns.push(Column::new("adjust".into(), adjust));
            columns.push(Column::new("adjust_gap".into(), gap));
        }
        DataType::FinancialReport => {
            let fins: Vec<&FinancialFields> = rows
                .iter()
                .map(|r| {
                    r.financial()
                        .ok_or_else(|| DataError::Other(format!("non-financial row for {}", r.date)))
                })
                .collect::<Result<_, _>>()?;
            for name in FINANCIAL_COLUMNS {
                let values: Vec<Option<f64>> = fins.iter().map(|f| f.get(name)).collect();
                columns.push(Column::new((*name).into(), values));
            }
        }
        DataType::AltData => {
            let alts: Vec<&AltFields> = rows
                .iter()
                .map(|r| {
                    r.alt()
                        .ok_or_else(|| DataError::Other(format!("non-alt row for {}", r.date)))
                })
                .collect::<Result<_, _>>()?;
            let items: Vec<Option<&str>> = rows.iter().map(|r| r.item.as_deref()).collect();
            let texts: Vec<Option<&str>> = alts.iter().map(|a| a.text.as_deref()).collect();
            let values: Vec<Option<f64>> = alts.iter().map(|a| a.value).collect();
            columns.push(Column::new("item".into(), items));
            columns.push(Column::new("text".into(), texts));
            columns.push(Column::new("value".into(), values));
        }
    }
    columns.push(Column::new("source".into(), sources));

    DataFrame::new(columns).map_err(encode_err)
}

fn price_value(p: &PriceFields, column: &str) -> Option<f64> {
    match column {
        "open" => p.open,
        "high" => p.high,
        "low" => p.low,
        "close" => p.close,
        "pre_close" => p.pre_close,
        "volume" => p.volume,
        "amount" => p.amount,
        "turnover" => p.turnover,
        "pct_chg" => p.pct_chg,
        "amplitude" => p.amplitude,
        "vwap" => p.vwap,
        "pe_ttm" => p.pe_ttm,
        "pb_mrq" => p.pb_mrq,
        "ps_ttm" => p.ps_ttm,
        "pcf_ncf_ttm" => p.pcf_ncf_ttm,
        _ => None,
    }
}

fn set_price_value(p: &mut PriceFields, column: &str, value: Option<f64>) {
    let slot = match column {
        "open" => &mut p.open,
        "high" => &mut p.high,
        "low" => &mut p.low,
        "close" => &mut p.close,
        "pre_close" => &mut p.pre_close,
        "volume" => &mut p.volume,
        "amount" => &mut p.amount,
        "turnover" => &mut p.turnover,
        "pct_chg" => &mut p.pct_chg,
        "amplitude" => &mut p.amplitude,
        "vwap" => &mut p.vwap,
        "pe_ttm" => &mut p.pe_ttm,
        "pb_mrq" => &mut p.pb_mrq,
        "ps_ttm" => &mut p.ps_ttm,
        "pcf_ncf_ttm" => &mut p.pcf_ncf_ttm,
        _ => return,
    };
    *slot = value;
}

/// Load a partition file, validate it, and decode it into rows.
fn read_partition(path: &Path, data_type: DataType) -> Result<Vec<CanonicalRow>, DataError> {
    let file = fs::File::open(path).map_err(|e| DataError::Other(format!("open: {e}")))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| DataError::Other(format!("read: {e}")))?;

    if df.height() == 0 {
        return Err(DataError::Other("empty partition file".into()));
    }
    let df = schema::conform(df, data_type).map_err(|e| DataError::Other(e.to_string()))?;
    dataframe_to_rows(&df, data_type)
}

/// Convert a validated DataFrame back into canonical rows.
pub fn dataframe_to_rows(df: &DataFrame, data_type: DataType) -> Result<Vec<CanonicalRow>, DataError> {
    let col_err = |e: PolarsError| DataError::Other(format!("column read: {e}"));
    let f64_column = |name: &str| -> Result<Float64Chunked, DataError> {
        Ok(df.column(name).map_err(col_err)?.f64().map_err(col_err)?.clone())
    };

    let codes = df.column("code").map_err(col_err)?.str().map_err(col_err)?;
    let dates = df
        .column(schema::date_column(data_type))
        .map_err(col_err)?
        .date()
        .map_err(col_err)?;
    let sources = df.column("source").map_err(col_err)?.str().map_err(col_err)?;

    let n = df.height();
    let mut rows = Vec::with_capacity(n);
    let mut bodies: Vec<RowBody> = Vec::with_capacity(n);
    let mut items: Vec<Option<String>> = vec![None; n];

    match data_type {
        DataType::PriceDaily | DataType::ConceptIndex => {
            let values: BTreeMap<&str, Float64Chunked> = PRICE_VALUE_COLUMNS
                .iter()
                .map(|c| f64_column(c).map(|ca| (*c, ca)))
                .collect::<Result<_, _>>()?;
            let trade_status = df.column("trade_status").map_err(col_err)?.i32().map_err(col_err)?;
            let is_st = df.column("is_st").map_err(col_err)?.i32().map_err(col_err)?;
            let adjust = df.column("adjust").map_err(col_err)?.str().map_err(col_err)?;
            let gap = df.column("adjust_gap").map_err(col_err)?.bool().map_err(col_err)?;

            for i in 0..n {
                let mut p = PriceFields {
                    trade_status: trade_status.get(i),
                    is_st: is_st.get(i),
                    adjust: adjust.get(i).and_then(Adjust::parse).unwrap_or_default(),
                    adjust_gap: gap.get(i).unwrap_or(false),
                    ..Default::default()
                };
                for (name, ca) in &values {
                    set_price_value(&mut p, name, ca.get(i));
                }
                bodies.push(RowBody::Price(p));
            }
        }
        DataType::FinancialReport => {
            let values: Vec<(&str, Float64Chunked)> = FINANCIAL_COLUMNS
                .iter()
                .map(|c| f64_column(c).map(|ca| (*c, ca)))
                .collect::<Result<_, _>>()?;
            for i in 0..n {
                let values = values
                    .iter()
                    .filter_map(|(name, ca)| ca.get(i).map(|v| (name.to_string(), v)))
                    .collect();
                bodies.push(RowBody::Financial(FinancialFields { values }));
            }
        }
        DataType::AltData => {
            let item = df.column("item").map_err(col_err)?.str().map_err(col_err)?;
            let text = df.column("text").map_err(col_err)?.str().map_err(col_err)?;
            let value = f64_column("value")?;
            for (i, slot) in items.iter_mut().enumerate() {
                *slot = item.get(i).map(str::to_string);
                bodies.push(RowBody::Alt(AltFields {
                    text: text.get(i).map(str::to_string),
                    value: value.get(i),
                }));
            }
        }
    }

    for (i, (body, item)) in bodies.into_iter().zip(items).enumerate() {
        let code = codes
            .get(i)
            .ok_or_else(|| DataError::Other(format!("null code at row {i}")))?;
        let days = dates
            .get(i)
            .ok_or_else(|| DataError::Other(format!("null date at row {i}")))?;
        rows.push(CanonicalRow {
            code: code.to_string(),
            date: epoch() + chrono::Duration::days(days as i64),
            item,
            source: sources.get(i).unwrap_or_default().to_string(),
            body,
        });
    }
    Ok(rows)
}
