//! Normalizer: source-native raw records → canonical rows.
//!
//! One branch per `RawRecord` variant. Nothing source-specific survives past
//! this module. Row-level problems never abort a batch: the row is dropped
//! (or, for a financial metric, the value is nulled) and a `RowIssue` is
//! recorded for the run manifest.

use super::clean::{parse_cn_number, parse_date, parse_number, Cell};
use super::provider::{BaostockRow, RawBatch, RawRecord, RowError};
use super::schema::{financial_column, REPORT_DATE_HEADER};
use crate::domain::{
    Adjust, AltFields, Asset, CanonicalRow, DataType, FinancialFields, PriceFields, RowBody,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Largest tolerated difference, in percentage points, between the change a
/// source reports and the change implied by consecutive closes.
pub const ADJUST_GAP_TOLERANCE_PP: f64 = 0.5;

/// Eastmoney reports volume in lots (手).
const SHARES_PER_LOT: f64 = 100.0;

/// Column bindings of an alternative-data series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltBinding {
    #[serde(default = "default_alt_date_column")]
    pub date_column: String,
    /// Secondary key column (headline, industry name, ...).
    #[serde(default)]
    pub item_column: Option<String>,
    #[serde(default)]
    pub text_column: Option<String>,
    #[serde(default)]
    pub value_column: Option<String>,
}

fn default_alt_date_column() -> String {
    "date".to_string()
}

impl Default for AltBinding {
    fn default() -> Self {
        Self {
            date_column: default_alt_date_column(),
            item_column: None,
            text_column: None,
            value_column: None,
        }
    }
}

/// A soft, per-row problem found while normalizing.
#[derive(Debug, Clone, PartialEq)]
pub struct RowIssue {
    /// Position of the raw record in its batch.
    pub index: usize,
    pub error: RowError,
    /// Whether the row was dropped (as opposed to kept with a nulled value).
    pub dropped: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeOutput {
    /// Canonical rows in upstream order.
    pub rows: Vec<CanonicalRow>,
    pub issues: Vec<RowIssue>,
    /// Rows flagged `adjust_gap`.
    pub adjust_gaps: usize,
}

impl NormalizeOutput {
    pub fn dropped(&self) -> usize {
        self.issues.iter().filter(|i| i.dropped).count()
    }

    /// Append another pass's output, keeping pass order.
    pub fn extend(&mut self, other: NormalizeOutput) {
        self.rows.extend(other.rows);
        self.issues.extend(other.issues);
        self.adjust_gaps += other.adjust_gaps;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    alt: AltBinding,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alt_binding(alt: AltBinding) -> Self {
        Self { alt }
    }

    pub fn normalize(&self, asset: &Asset, data_type: DataType, batch: &RawBatch) -> NormalizeOutput {
        let mut out = NormalizeOutput::default();
        let mut prev_close: Option<(NaiveDate, f64)> = None;

        for (index, record) in batch.records.iter().enumerate() {
            let result = match (data_type, record) {
                (
                    DataType::PriceDaily | DataType::ConceptIndex,
                    RawRecord::EastmoneyKline { line, adjust },
                ) => parse_kline(line, *adjust).map(|bar| finish_bar(bar, &mut prev_close)),
                (DataType::PriceDaily | DataType::ConceptIndex, RawRecord::Baostock(row)) => {
                    parse_baostock(row).map(|bar| finish_bar(bar, &mut prev_close))
                }
                (DataType::FinancialReport, RawRecord::ThsFinancial(row)) => {
                    self.parse_financial(row, index, &mut out.issues)
                }
                (DataType::AltData, RawRecord::AltRow(row)) => self.parse_alt(row),
                (dt, other) => Err(RowError::UnexpectedRecord {
                    record: record_kind(other).to_string(),
                    data_type: dt.to_string(),
                }),
            };

            match result {
                Ok((date, item, body)) => {
                    if matches!(&body, RowBody::Price(p) if p.adjust_gap) {
                        out.adjust_gaps += 1;
                    }
                    out.rows.push(CanonicalRow {
                        code: asset.code.clone(),
                        date,
                        item,
                        source: batch.source.clone(),
                        body,
                    });
                }
                Err(error) => {
                    debug!(code = %asset.code, index, %error, "row dropped");
                    out.issues.push(RowIssue {
                        index,
                        error,
                        dropped: true,
                    });
                }
            }
        }

        if out.adjust_gaps > 0 {
            warn!(
                code = %asset.code,
                rows = out.adjust_gaps,
                "reported change disagrees with adjusted closes; series may not be back-adjusted"
            );
        }
        out
    }

    fn parse_financial(
        &self,
        row: &BTreeMap<String, String>,
        index: usize,
        issues: &mut Vec<RowIssue>,
    ) -> Result<(NaiveDate, Option<String>, RowBody), RowError> {
        let date = row
            .iter()
            .find(|(k, _)| k.trim() == REPORT_DATE_HEADER)
            .and_then(|(_, v)| parse_date(v))
            .ok_or_else(|| RowError::PartitionKeyMissing {
                field: REPORT_DATE_HEADER.to_string(),
            })?;

        let mut values = BTreeMap::new();
        for (header, raw) in row {
            let Some(column) = financial_column(header) else {
                continue;
            };
            match parse_cn_number(raw) {
                Cell::Value(v) => {
                    values.insert(column.to_string(), v);
                }
                Cell::Null => {}
                Cell::Invalid => issues.push(RowIssue {
                    index,
                    error: RowError::Coercion {
                        field: column.to_string(),
                        value: raw.clone(),
                    },
                    dropped: false,
                }),
            }
        }
        Ok((date, None, RowBody::Financial(FinancialFields { values })))
    }

    fn parse_alt(
        &self,
        row: &BTreeMap<String, String>,
    ) -> Result<(NaiveDate, Option<String>, RowBody), RowError> {
        let binding = &self.alt;
        let date = row
            .get(&binding.date_column)
            .and_then(|v| parse_date(v))
            .ok_or_else(|| RowError::PartitionKeyMissing {
                field: binding.date_column.clone(),
            })?;

        let cell = |column: &Option<String>| {
            column
                .as_ref()
                .and_then(|c| row.get(c))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let value = match &binding.value_column {
            Some(column) => {
                let raw = row.get(column).map(String::as_str).unwrap_or("");
                numeric(column, raw)?
            }
            None => None,
        };

        Ok((
            date,
            cell(&binding.item_column),
            RowBody::Alt(AltFields {
                text: cell(&binding.text_column),
                value,
            }),
        ))
    }
}

fn record_kind(record: &RawRecord) -> &'static str {
    match record {
        RawRecord::EastmoneyKline { .. } => "eastmoney_kline",
        RawRecord::Baostock(_) => "baostock",
        RawRecord::ThsFinancial(_) => "ths_financial",
        RawRecord::AltRow(_) => "alt_row",
    }
}

/// Placeholder → `None`, garbage → `Coercion`.
fn numeric(field: &str, raw: &str) -> Result<Option<f64>, RowError> {
    match parse_number(raw) {
        Cell::Value(v) => Ok(Some(v)),
        Cell::Null => Ok(None),
        Cell::Invalid => Err(RowError::Coercion {
            field: field.to_string(),
            value: raw.to_string(),
        }),
    }
}

/// Like [`numeric`], but fractional or out-of-range values are `Coercion`.
fn integer(field: &str, raw: &str) -> Result<Option<i32>, RowError> {
    match numeric(field, raw)? {
        None => Ok(None),
        Some(v) if v.fract() == 0.0 && v >= i32::MIN as f64 && v <= i32::MAX as f64 => Ok(Some(v as i32)),
        Some(_) => Err(RowError::Coercion {
            field: field.to_string(),
            value: raw.to_string(),
        }),
    }
}

/// A parsed bar before derived fields are filled in.
struct Bar {
    date: NaiveDate,
    fields: PriceFields,
}

fn parse_kline(line: &str, adjust: Adjust) -> Result<Bar, RowError> {
    // date,open,close,high,low,volume,amount,amplitude,pct_chg,change,turnover
    let cols: Vec<&str> = line.split(',').map(str::trim).collect();
    let col = |i: usize| cols.get(i).copied().unwrap_or("");

    let date = parse_date(col(0)).ok_or_else(|| RowError::PartitionKeyMissing {
        field: "date".to_string(),
    })?;

    let close = numeric("close", col(2))?;
    let change = numeric("change", col(9))?;
    let fields = PriceFields {
        open: numeric("open", col(1))?,
        close,
        high: numeric("high", col(3))?,
        low: numeric("low", col(4))?,
        volume: numeric("volume", col(5))?.map(|lots| lots * SHARES_PER_LOT),
        amount: numeric("amount", col(6))?,
        amplitude: numeric("amplitude", col(7))?,
        pct_chg: numeric("pct_chg", col(8))?,
        turnover: numeric("turnover", col(10))?,
        pre_close: close.zip(change).map(|(c, d)| c - d),
        adjust,
        ..Default::default()
    };
    check_prices(&fields)?;
    Ok(Bar { date, fields })
}

fn parse_baostock(row: &BaostockRow) -> Result<Bar, RowError> {
    let date = parse_date(&row.date).ok_or_else(|| RowError::PartitionKeyMissing {
        field: "date".to_string(),
    })?;

    let fields = PriceFields {
        open: numeric("open", &row.open)?,
        high: numeric("high", &row.high)?,
        low: numeric("low", &row.low)?,
        close: numeric("close", &row.close)?,
        pre_close: numeric("preclose", &row.preclose)?,
        volume: numeric("volume", &row.volume)?,
        amount: numeric("amount", &row.amount)?,
        turnover: numeric("turn", &row.turn)?,
        pct_chg: numeric("pctchg", &row.pct_chg)?,
        pe_ttm: numeric("pettm", &row.pe_ttm)?,
        pb_mrq: numeric("pbmrq", &row.pb_mrq)?,
        ps_ttm: numeric("psttm", &row.ps_ttm)?,
        pcf_ncf_ttm: numeric("pcfncfttm", &row.pcf_ncf_ttm)?,
        trade_status: integer("tradestatus", &row.tradestatus)?,
        is_st: Some(integer("isst", &row.is_st)?.unwrap_or(0)),
        adjust: Adjust::from_baostock_flag(&row.adjustflag).unwrap_or_default(),
        ..Default::default()
    };
    check_prices(&fields)?;
    Ok(Bar { date, fields })
}

fn check_prices(p: &PriceFields) -> Result<(), RowError> {
    for (name, value) in [("open", p.open), ("high", p.high), ("low", p.low), ("close", p.close)] {
        if let Some(v) = value {
            if v <= 0.0 {
                return Err(RowError::InvalidPrice(format!("{name} = {v}")));
            }
        }
    }
    if let (Some(_), Some(high), Some(low), Some(_)) = (p.open, p.high, p.low, p.close) {
        if high < low {
            return Err(RowError::InvalidPrice(format!("high {high} < low {low}")));
        }
    }
    Ok(())
}

/// Fill derived fields and run the adjustment check against the previous
/// bar's close. `prev` tracks the latest earlier-dated close in the batch.
fn finish_bar(
    bar: Bar,
    prev: &mut Option<(NaiveDate, f64)>,
) -> (NaiveDate, Option<String>, RowBody) {
    let Bar { date, mut fields } = bar;
    let prev_close = prev.filter(|(d, _)| *d < date).map(|(_, c)| c);
    let reported_pct = fields.pct_chg;

    if fields.pre_close.is_none() {
        fields.pre_close = prev_close;
    }

    if let (Some(close), Some(pre)) = (fields.close, fields.pre_close) {
        if pre > 0.0 {
            if fields.pct_chg.is_none() {
                fields.pct_chg = Some((close / pre - 1.0) * 100.0);
            }
            if fields.amplitude.is_none() {
                if let (Some(high), Some(low)) = (fields.high, fields.low) {
                    fields.amplitude = Some((high - low) / pre * 100.0);
                }
            }
        }
    }

    if let (Some(amount), Some(volume)) = (fields.amount, fields.volume) {
        if volume > 0.0 {
            fields.vwap = Some(amount / volume);
        }
    }

    // Only a change the source itself reported can disagree with the closes.
    if let (Some(close), Some(reported), Some(prev_close)) = (fields.close, reported_pct, prev_close) {
        if prev_close > 0.0 {
            let implied = (close / prev_close - 1.0) * 100.0;
            fields.adjust_gap = (implied - reported).abs() > ADJUST_GAP_TOLERANCE_PP;
        }
    }

    if let Some(close) = fields.close {
        if prev.map_or(true, |(d, _)| d <= date) {
            *prev = Some((date, close));
        }
    }

    (date, None, RowBody::Price(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AssetKind;

    fn stock() -> Asset {
        Asset::new("sh.600519", AssetKind::Stock)
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn kline_batch(lines: &[&str]) -> RawBatch {
        RawBatch::new(
            "eastmoney",
            lines
                .iter()
                .map(|l| RawRecord::EastmoneyKline {
                    line: l.to_string(),
                    adjust: Adjust::Back,
                })
                .collect(),
        )
    }

    #[test]
    fn kline_fields_and_lot_conversion() {
        let batch = kline_batch(&[
            "2024-01-02,1715.00,1685.01,1718.19,1678.10,32156,5428557100.00,2.35,-2.60,-44.99,0.26",
        ]);
        let out = Normalizer::new().normalize(&stock(), DataType::PriceDaily, &batch);
        assert!(out.issues.is_empty());
        let row = &out.rows[0];
        assert_eq!(row.date, d(2024, 1, 2));
        assert_eq!(row.source, "eastmoney");
        let p = row.price().unwrap();
        assert_eq!(p.volume, Some(3_215_600.0));
        assert_eq!(p.adjust, Adjust::Back);
        assert!((p.pre_close.unwrap() - 1730.0).abs() < 1e-9);
        assert!((p.vwap.unwrap() - 5428557100.0 / 3_215_600.0).abs() < 1e-9);
        assert!(!p.adjust_gap);
    }

    #[test]
    fn derived_fields_from_previous_close() {
        let batch = RawBatch::new(
            "baostock",
            vec![
                RawRecord::Baostock(BaostockRow {
                    date: "2024-01-02".into(),
                    open: "10".into(),
                    high: "11".into(),
                    low: "9".into(),
                    close: "10".into(),
                    volume: "100".into(),
                    amount: "1000".into(),
                    adjustflag: "1".into(),
                    ..Default::default()
                }),
                RawRecord::Baostock(BaostockRow {
                    date: "20240103".into(),
                    open: "10".into(),
                    high: "12".into(),
                    low: "10".into(),
                    close: "11".into(),
                    volume: "0".into(),
                    amount: "0".into(),
                    adjustflag: "1".into(),
                    ..Default::default()
                }),
            ],
        );
        let out = Normalizer::new().normalize(&stock(), DataType::PriceDaily, &batch);
        assert_eq!(out.rows.len(), 2);

        let first = out.rows[0].price().unwrap();
        assert_eq!(first.pre_close, None);
        assert_eq!(first.pct_chg, None);
        assert_eq!(first.is_st, Some(0));
        assert_eq!(first.adjust, Adjust::Back);

        let second = out.rows[1].price().unwrap();
        assert_eq!(second.pre_close, Some(10.0));
        assert!((second.pct_chg.unwrap() - 10.0).abs() < 1e-9);
        assert!((second.amplitude.unwrap() - 20.0).abs() < 1e-9);
        assert_eq!(second.vwap, None);
    }

    #[test]
    fn adjust_gap_flagged_but_row_kept() {
        // Close drops 10% while the source says -0.5%: an unadjusted ex-dividend day.
        let batch = kline_batch(&[
            "2024-06-03,100,100,101,99,1000,100000,2.0,0.00,0.00,1.0",
            "2024-06-04,90,90,91,89,1000,90000,2.0,-0.50,-0.45,1.0",
        ]);
        let out = Normalizer::new().normalize(&stock(), DataType::PriceDaily, &batch);
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.adjust_gaps, 1);
        assert!(out.rows[1].price().unwrap().adjust_gap);
    }

    #[test]
    fn derived_change_is_not_checked_for_adjust_gap() {
        // Source preclose reflects an ex-dividend reset; no pctChg reported.
        let bao = |date: &str, close: &str, preclose: &str| {
            RawRecord::Baostock(BaostockRow {
                date: date.into(),
                open: close.into(),
                high: close.into(),
                low: close.into(),
                close: close.into(),
                preclose: preclose.into(),
                volume: "100".into(),
                amount: "1000".into(),
                adjustflag: "1".into(),
                ..Default::default()
            })
        };
        let batch = RawBatch::new(
            "baostock",
            vec![bao("2024-06-03", "10", "10"), bao("2024-06-04", "9", "9")],
        );
        let out = Normalizer::new().normalize(&stock(), DataType::PriceDaily, &batch);
        assert_eq!(out.rows.len(), 2);
        let second = out.rows[1].price().unwrap();
        assert_eq!(second.pct_chg, Some(0.0));
        assert!(!second.adjust_gap);
        assert_eq!(out.adjust_gaps, 0);
    }

    #[test]
    fn fractional_or_huge_status_is_a_coercion_error() {
        let bao = |date: &str, status: &str| {
            RawRecord::Baostock(BaostockRow {
                date: date.into(),
                open: "10".into(),
                high: "10".into(),
                low: "10".into(),
                close: "10".into(),
                tradestatus: status.into(),
                ..Default::default()
            })
        };
        let batch = RawBatch::new(
            "baostock",
            vec![
                bao("2024-01-02", "1"),
                bao("2024-01-03", "1.7"),
                bao("2024-01-04", "1e12"),
                bao("2024-01-05", "1.0"),
            ],
        );
        let out = Normalizer::new().normalize(&stock(), DataType::PriceDaily, &batch);
        let dates: Vec<_> = out.rows.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![d(2024, 1, 2), d(2024, 1, 5)]);
        assert_eq!(out.rows[1].price().unwrap().trade_status, Some(1));
        assert_eq!(out.issues.len(), 2);
        assert!(out
            .issues
            .iter()
            .all(|i| matches!(&i.error, RowError::Coercion { field, .. } if field == "tradestatus")));
    }

    #[test]
    fn placeholders_are_null_and_garbage_drops_row() {
        let batch = kline_batch(&[
            "2024-01-02,10,10,10,10,--,-,-,-,-,-",
            "2024-01-03,abc,10,10,10,1,1,1,1,1,1",
            "not-a-date,10,10,10,10,1,1,1,1,1,1",
        ]);
        let out = Normalizer::new().normalize(&stock(), DataType::PriceDaily, &batch);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].price().unwrap().volume, None);
        assert_eq!(out.dropped(), 2);
        assert!(matches!(out.issues[0].error, RowError::Coercion { .. }));
        assert!(matches!(out.issues[1].error, RowError::PartitionKeyMissing { .. }));
    }

    #[test]
    fn invalid_ohlc_is_dropped() {
        let batch = kline_batch(&[
            "2024-01-02,10,10,9,11,1,1,1,1,1,1",
            "2024-01-03,0,10,10,10,1,1,1,1,1,1",
        ]);
        let out = Normalizer::new().normalize(&stock(), DataType::PriceDaily, &batch);
        assert!(out.rows.is_empty());
        assert!(out
            .issues
            .iter()
            .all(|i| matches!(i.error, RowError::InvalidPrice(_))));
    }

    #[test]
    fn financial_rows_mapped_and_soft_coerced() {
        let row: BTreeMap<String, String> = [
            ("报告期", "1997-12-31"),
            ("净利润", "6.45亿"),
            ("净利润同比增长率", "2.53%"),
            ("资产负债率", "abc"),
            ("董事长", "someone"),
            ("营业总收入", "False"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let mut no_date = row.clone();
        no_date.insert("报告期".into(), "--".into());

        let batch = RawBatch::new(
            "ths",
            vec![RawRecord::ThsFinancial(row), RawRecord::ThsFinancial(no_date)],
        );
        let asset = Asset::new("sz.000001", AssetKind::Stock);
        let out = Normalizer::new().normalize(&asset, DataType::FinancialReport, &batch);

        assert_eq!(out.rows.len(), 1);
        let f = out.rows[0].financial().unwrap();
        assert_eq!(out.rows[0].date, d(1997, 12, 31));
        assert_eq!(f.get("net_profit"), Some(6.45 * 1e8));
        assert_eq!(f.get("net_profit_yoy"), Some(2.53 * 0.01));
        assert_eq!(f.get("debt_to_assets_ratio"), None);
        assert_eq!(f.get("total_revenue"), None);
        assert_eq!(f.values.len(), 2);

        assert_eq!(out.issues.len(), 2);
        assert!(!out.issues[0].dropped);
        assert!(out.issues[1].dropped);
        assert_eq!(out.dropped(), 1);
    }

    #[test]
    fn alt_rows_carry_item_key() {
        let binding = AltBinding {
            date_column: "变动日期".into(),
            item_column: Some("行业名称".into()),
            text_column: None,
            value_column: Some("静态市盈率-加权平均".into()),
        };
        let rows = [("20240105", "农业", "21.3"), ("20240105", "采矿业", "--")];
        let batch = RawBatch::new(
            "csv",
            rows.iter()
                .map(|(date, item, pe)| {
                    RawRecord::AltRow(
                        [
                            ("变动日期".to_string(), date.to_string()),
                            ("行业名称".to_string(), item.to_string()),
                            ("静态市盈率-加权平均".to_string(), pe.to_string()),
                        ]
                        .into_iter()
                        .collect(),
                    )
                })
                .collect(),
        );
        let asset = Asset::new("industry_pe", AssetKind::Alt);
        let out = Normalizer::with_alt_binding(binding).normalize(&asset, DataType::AltData, &batch);

        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.rows[0].item.as_deref(), Some("农业"));
        assert_eq!(out.rows[0].alt().unwrap().value, Some(21.3));
        assert_eq!(out.rows[1].alt().unwrap().value, None);
        assert_ne!(out.rows[0].key(), out.rows[1].key());
    }

    #[test]
    fn wrong_record_for_data_type_is_rejected() {
        let batch = kline_batch(&["2024-01-02,10,10,10,10,1,1,1,1,1,1"]);
        let out = Normalizer::new().normalize(&stock(), DataType::FinancialReport, &batch);
        assert!(out.rows.is_empty());
        assert!(matches!(out.issues[0].error, RowError::UnexpectedRecord { .. }));
    }
}
