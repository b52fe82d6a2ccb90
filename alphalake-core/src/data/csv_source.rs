//! CSV drop-directory source.
//!
//! Reads raw per-asset exports from `{dir}/{file_stem(code)}.csv`. This is the
//! path for upstreams that have no Rust-native client (Baostock exports, THS
//! financial abstracts, alternative-data dumps) and the fallback when the HTTP
//! source is unavailable.

use super::clean::parse_date;
use super::provider::{BaostockRow, DataError, RawBatch, RawRecord, SourceAdapter};
use crate::domain::{Asset, DateRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Column layout of the files in a drop directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsvFormat {
    /// Baostock `query_history_k_data_plus` export.
    Baostock,
    /// THS financial abstract (按报告期), Chinese headers.
    ThsFinancial,
    /// Free-form alternative data with a named date column.
    Alt,
}

impl CsvFormat {
    /// Provenance tag written to the `source` column.
    pub fn source_tag(&self) -> &'static str {
        match self {
            CsvFormat::Baostock => "baostock",
            CsvFormat::ThsFinancial => "ths",
            CsvFormat::Alt => "csv",
        }
    }

    fn default_date_column(&self) -> &'static str {
        match self {
            CsvFormat::Baostock | CsvFormat::Alt => "date",
            CsvFormat::ThsFinancial => "报告期",
        }
    }
}

pub struct CsvDirSource {
    dir: PathBuf,
    format: CsvFormat,
    date_column: String,
}

impl CsvDirSource {
    pub fn new(dir: impl Into<PathBuf>, format: CsvFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
            date_column: format.default_date_column().to_string(),
        }
    }

    pub fn with_date_column(mut self, column: impl Into<String>) -> Self {
        self.date_column = column.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, asset: &Asset) -> PathBuf {
        self.dir.join(format!("{}.csv", asset.file_stem()))
    }

    /// Rows whose date is unparseable are kept so the Normalizer can reject
    /// them with a proper row error instead of silently losing them here.
    fn in_range(&self, raw_date: Option<&str>, range: DateRange) -> bool {
        match raw_date.and_then(parse_date) {
            Some(date) => range.contains(date),
            None => true,
        }
    }

    fn read_records(&self, file: File, range: DateRange) -> Result<Vec<RawRecord>, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(io::BufReader::new(file));

        let mut records = Vec::new();
        match self.format {
            CsvFormat::Baostock => {
                for row in reader.deserialize::<BaostockRow>() {
                    let row = row?;
                    if self.in_range(Some(&row.date), range) {
                        records.push(RawRecord::Baostock(row));
                    }
                }
            }
            CsvFormat::ThsFinancial | CsvFormat::Alt => {
                for row in reader.deserialize::<BTreeMap<String, String>>() {
                    let row = row?;
                    if !self.in_range(row.get(&self.date_column).map(String::as_str), range) {
                        continue;
                    }
                    records.push(match self.format {
                        CsvFormat::ThsFinancial => RawRecord::ThsFinancial(row),
                        _ => RawRecord::AltRow(row),
                    });
                }
            }
        }
        Ok(records)
    }
}

impl SourceAdapter for CsvDirSource {
    fn name(&self) -> &str {
        self.format.source_tag()
    }

    fn fetch(&self, asset: &Asset, range: DateRange) -> Result<RawBatch, DataError> {
        let path = self.file_for(asset);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DataError::not_found(&asset.code))
            }
            Err(e) => {
                return Err(DataError::unavailable(
                    self.name(),
                    format!("open {}: {e}", path.display()),
                ))
            }
        };

        let records = self.read_records(file, range).map_err(|e| {
            DataError::unavailable(self.name(), format!("read {}: {e}", path.display()))
        })?;
        Ok(RawBatch::new(self.format.source_tag(), records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AssetKind;
    use chrono::NaiveDate;
    use std::fs;

    fn year_2024() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        )
    }

    #[test]
    fn baostock_rows_filtered_by_range() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("sh.600519.csv"),
            "date,code,open,high,low,close,volume\n\
             2023-12-29,sh.600519,1,1,1,1,10\n\
             2024-01-02,sh.600519,2,2,2,2,20\n\
             bad-date,sh.600519,3,3,3,3,30\n",
        )
        .unwrap();

        let src = CsvDirSource::new(dir.path(), CsvFormat::Baostock);
        let batch = src
            .fetch(&Asset::new("sh.600519", AssetKind::Stock), year_2024())
            .unwrap();

        assert_eq!(batch.source, "baostock");
        assert_eq!(batch.len(), 2);
        match &batch.records[0] {
            RawRecord::Baostock(row) => assert_eq!(row.date, "2024-01-02"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ths_rows_keyed_by_chinese_headers() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("sz.000001.csv"),
            "报告期,净利润,资产负债率\n2024-03-31,6.29亿,97.57%\n",
        )
        .unwrap();

        let src = CsvDirSource::new(dir.path(), CsvFormat::ThsFinancial);
        let batch = src
            .fetch(&Asset::new("sz.000001", AssetKind::Stock), year_2024())
            .unwrap();

        assert_eq!(batch.source, "ths");
        match &batch.records[0] {
            RawRecord::ThsFinancial(row) => assert_eq!(row["净利润"], "6.29亿"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn alt_rows_use_configured_date_column() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("industry_pe.csv"),
            "变动日期,行业名称,静态市盈率-加权平均\n20240105,农业,21.3\n20230105,农业,19.0\n",
        )
        .unwrap();

        let src = CsvDirSource::new(dir.path(), CsvFormat::Alt).with_date_column("变动日期");
        let batch = src
            .fetch(&Asset::new("industry_pe", AssetKind::Alt), year_2024())
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn missing_file_is_asset_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let src = CsvDirSource::new(dir.path(), CsvFormat::Baostock);
        let err = src
            .fetch(&Asset::new("sh.600000", AssetKind::Stock), year_2024())
            .unwrap_err();
        assert!(matches!(err, DataError::AssetNotFound { .. }));
    }
}
