//! Data types, datasets, partition keys and run modes.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical data type. Determines the canonical schema and the partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    PriceDaily,
    FinancialReport,
    ConceptIndex,
    AltData,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::PriceDaily => "price_daily",
            DataType::FinancialReport => "financial_report",
            DataType::ConceptIndex => "concept_index",
            DataType::AltData => "alt_data",
        }
    }

    /// Report-frequency series are bucketed by report period rather than trade date.
    pub fn is_report_frequency(&self) -> bool {
        matches!(self, DataType::FinancialReport)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A storage directory under the lake root, bound to one data type.
///
/// Directory names are part of the public layout; downstream readers scan
/// `{dataset}/year=*/*.parquet` directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dataset {
    name: String,
    data_type: DataType,
}

impl Dataset {
    pub fn stock_price() -> Self {
        Self::new("stock_price_daily", DataType::PriceDaily)
    }

    pub fn index_price() -> Self {
        Self::new("index_price_daily", DataType::PriceDaily)
    }

    pub fn etf_price() -> Self {
        Self::new("etf_price_daily", DataType::PriceDaily)
    }

    pub fn concept_price() -> Self {
        Self::new("concept_price_daily", DataType::ConceptIndex)
    }

    pub fn stock_financial() -> Self {
        Self::new("stock_financial", DataType::FinancialReport)
    }

    /// `alt_{series}`: one directory per alternative-data series.
    pub fn alt(series: &str) -> Self {
        Self::new(format!("alt_{series}"), DataType::AltData)
    }

    fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Partition key: a calendar year (trade year, or report-period year).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey(pub i32);

impl PartitionKey {
    pub fn for_date(date: NaiveDate) -> Self {
        Self(date.year())
    }

    pub fn year(&self) -> i32 {
        self.0
    }

    /// Hive-style directory segment: `year=2024`.
    pub fn dir_name(&self) -> String {
        format!("year={}", self.0)
    }

    /// Parse a `year=2024` directory segment.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        name.strip_prefix("year=")?.parse().ok().map(Self)
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.0, 1, 1)
    }

}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "year={}", self.0)
    }
}

/// Run mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Rebuild every partition from the asset's earliest date.
    Full,
    /// Rebuild only the partition(s) covering the current period.
    Update,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::Update => "update",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(RunMode::Full),
            "update" => Ok(RunMode::Update),
            other => Err(format!("unknown run mode '{other}' (expected full or update)")),
        }
    }
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}
