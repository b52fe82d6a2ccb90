//! Source adapter trait, raw record variants and structured error types.
//!
//! The SourceAdapter trait abstracts over upstream sources (Eastmoney HTTP,
//! CSV drop directories) so the orchestrator can swap them and tests can mock them.

use crate::domain::{Adjust, Asset, DateRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// One daily row as exported by Baostock `query_history_k_data_plus`.
///
/// Every field is kept as the raw string; Baostock emits `""` for missing values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaostockRow {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub open: String,
    #[serde(default)]
    pub high: String,
    #[serde(default)]
    pub low: String,
    #[serde(default)]
    pub close: String,
    #[serde(default)]
    pub preclose: String,
    #[serde(default)]
    pub volume: String,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub adjustflag: String,
    #[serde(default)]
    pub turn: String,
    #[serde(default)]
    pub tradestatus: String,
    #[serde(default, rename = "pctChg")]
    pub pct_chg: String,
    #[serde(default, rename = "peTTM")]
    pub pe_ttm: String,
    #[serde(default, rename = "pbMRQ")]
    pub pb_mrq: String,
    #[serde(default, rename = "psTTM")]
    pub ps_ttm: String,
    #[serde(default, rename = "pcfNcfTTM")]
    pub pcf_ncf_ttm: String,
    #[serde(default, rename = "isST")]
    pub is_st: String,
}

/// A source-native record. Opaque outside the Normalizer branch that owns it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    /// Eastmoney kline line
    /// (`date,open,close,high,low,volume,amount,amplitude,pct_chg,change,turnover`)
    /// and the adjustment mode it was requested with.
    EastmoneyKline { line: String, adjust: Adjust },
    Baostock(BaostockRow),
    /// THS financial abstract row keyed by its Chinese column headers.
    ThsFinancial(BTreeMap<String, String>),
    /// Alternative-data row keyed by its source column names.
    AltRow(BTreeMap<String, String>),
}

/// Result of a successful fetch for one asset, in upstream order.
#[derive(Debug, Clone)]
pub struct RawBatch {
    /// Provenance tag carried onto every normalized row.
    pub source: String,
    pub records: Vec<RawRecord>,
}

impl RawBatch {
    pub fn new(source: impl Into<String>, records: Vec<RawRecord>) -> Self {
        Self {
            source: source.into(),
            records,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Structured error types for fetch and storage operations.
///
/// These are designed to be displayable in CLI output and the run report.
#[derive(Debug, Error)]
pub enum DataError {
    /// Network or upstream failure. Retryable.
    #[error("source '{source_name}' unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    /// Upstream has no data for this asset. Not retried.
    #[error("asset not found upstream: {code}")]
    AssetNotFound { code: String },

    #[error("hard stop: source has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    /// Partition write failed; the previous partition file is intact.
    #[error("write failed for {path}: {reason}")]
    WriteFailure { path: String, reason: String },

    #[error("read failed for {path}: {reason}")]
    ReadFailure { path: String, reason: String },

    #[error("data error: {0}")]
    Other(String),
}

impl DataError {
    pub fn unavailable(source_name: &str, reason: impl Into<String>) -> Self {
        DataError::SourceUnavailable {
            source_name: source_name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn not_found(code: &str) -> Self {
        DataError::AssetNotFound {
            code: code.to_string(),
        }
    }

    /// Only transient upstream failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DataError::SourceUnavailable { .. })
    }
}

/// Soft, per-row failures raised by the Normalizer. The row is dropped (or,
/// for financial metrics, the value nulled) and the batch carries on.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowError {
    #[error("cannot coerce field '{field}' value '{value}'")]
    Coercion { field: String, value: String },

    #[error("missing or invalid partition key field '{field}'")]
    PartitionKeyMissing { field: String },

    #[error("record of type {record} is not valid for {data_type}")]
    UnexpectedRecord { record: String, data_type: String },

    #[error("invalid price bar: {0}")]
    InvalidPrice(String),
}

/// Trait for upstream sources.
///
/// Implementations own their session state (HTTP client, login token) for the
/// lifetime of one run, and handle their own rate limiting. Retries belong to
/// the orchestrator.
pub trait SourceAdapter: Send + Sync {
    /// Provenance name of this source.
    fn name(&self) -> &str;

    /// Fetch raw records for one asset over an inclusive date range.
    fn fetch(&self, asset: &Asset, range: DateRange) -> Result<RawBatch, DataError>;

    /// Whether the source currently accepts requests (not blocked).
    fn is_available(&self) -> bool {
        true
    }
}
