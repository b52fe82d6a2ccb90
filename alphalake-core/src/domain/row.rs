//! CanonicalRow: the normalized, statically-typed record written to the lake.
//!
//! Everything downstream of the Normalizer works on these types only; source
//! specific shapes never cross that boundary.

use super::dataset::PartitionKey;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Price adjustment mode of a daily series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Adjust {
    /// Raw, unadjusted prices (indices, concept boards).
    #[default]
    #[serde(rename = "none")]
    None,
    /// Forward-adjusted (前复权).
    #[serde(rename = "qfq")]
    Forward,
    /// Back-adjusted (后复权). Preferred for stocks and ETFs: historical values
    /// never move when a new corporate action happens.
    #[serde(rename = "hfq")]
    Back,
}

impl Adjust {
    pub fn as_str(&self) -> &'static str {
        match self {
            Adjust::None => "none",
            Adjust::Forward => "qfq",
            Adjust::Back => "hfq",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Adjust::None),
            "qfq" => Some(Adjust::Forward),
            "hfq" => Some(Adjust::Back),
            _ => None,
        }
    }

    /// Baostock `adjustflag`: 1 = back, 2 = forward, 3 = none.
    pub fn from_baostock_flag(flag: &str) -> Option<Self> {
        match flag.trim() {
            "1" => Some(Adjust::Back),
            "2" => Some(Adjust::Forward),
            "3" => Some(Adjust::None),
            _ => None,
        }
    }
}

impl fmt::Display for Adjust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Daily bar fields (stocks, indices, ETFs, concept boards).
///
/// Volume is in shares, amount in CNY, `pct_chg`/`turnover`/`amplitude` in percent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceFields {
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub pre_close: Option<f64>,
    pub volume: Option<f64>,
    pub amount: Option<f64>,
    pub turnover: Option<f64>,
    pub pct_chg: Option<f64>,
    pub amplitude: Option<f64>,
    pub vwap: Option<f64>,
    pub pe_ttm: Option<f64>,
    pub pb_mrq: Option<f64>,
    pub ps_ttm: Option<f64>,
    pub pcf_ncf_ttm: Option<f64>,
    pub trade_status: Option<i32>,
    pub is_st: Option<i32>,
    pub adjust: Adjust,
    /// Source-reported change disagrees with the change implied by adjusted
    /// closes: an unadjusted corporate action slipped through.
    pub adjust_gap: bool,
}

/// Financial statement row: canonical metric name → value.
///
/// Keys are always members of [`crate::data::schema::FINANCIAL_COLUMNS`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialFields {
    pub values: BTreeMap<String, f64>,
}

impl FinancialFields {
    pub fn get(&self, column: &str) -> Option<f64> {
        self.values.get(column).copied()
    }
}

/// Alternative-data row payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AltFields {
    pub text: Option<String>,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowBody {
    Price(PriceFields),
    Financial(FinancialFields),
    Alt(AltFields),
}

/// Dedup key: (asset code, primary date or report period, optional item).
pub type RowKey = (String, NaiveDate, Option<String>);

/// A normalized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub code: String,
    /// Trade date, or report period end date for financial rows.
    pub date: NaiveDate,
    /// Secondary key for series with several rows per date (alt data only).
    pub item: Option<String>,
    /// Provenance tag, e.g. `eastmoney`, `baostock`, `ths`.
    pub source: String,
    pub body: RowBody,
}

impl CanonicalRow {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::for_date(self.date)
    }

    pub fn key(&self) -> RowKey {
        (self.code.clone(), self.date, self.item.clone())
    }

    pub fn price(&self) -> Option<&PriceFields> {
        match &self.body {
            RowBody::Price(p) => Some(p),
            _ => None,
        }
    }

    pub fn financial(&self) -> Option<&FinancialFields> {
        match &self.body {
            RowBody::Financial(f) => Some(f),
            _ => None,
        }
    }

    pub fn alt(&self) -> Option<&AltFields> {
        match &self.body {
            RowBody::Alt(a) => Some(a),
            _ => None,
        }
    }
}

/// BLAKE3 digest of a row set's logical content. Two partitions with equal
/// digests hold the same rows regardless of their physical encoding.
pub fn content_hash(rows: &[CanonicalRow]) -> String {
    let mut hasher = blake3::Hasher::new();
    for row in rows {
        // Serializing plain data with string keys cannot fail.
        if let Ok(bytes) = serde_json::to_vec(row) {
            hasher.update(&bytes);
            hasher.update(b"\n");
        }
    }
    hasher.finalize().to_hex().to_string()
}
