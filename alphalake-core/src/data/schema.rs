//! Canonical on-disk schema per data type.
//!
//! Every partition file of a dataset carries exactly these columns in this
//! order. Value columns are nullable; `code`, the date column and `source`
//! never are.

use crate::domain::DataType as LakeType;
use polars::prelude::{DataFrame, DataType, Field, Schema, SchemaExt, Series};

/// Bumped whenever a column is added, removed or retyped.
pub const SCHEMA_VERSION: u32 = 1;

/// THS financial abstract header → canonical column.
///
/// Several headers may map to the same column (upstream has shipped a
/// typo'd `净资产收益 率` header in the past).
pub const FINANCIAL_MAP: &[(&str, &str)] = &[
    // income statement
    ("净利润", "net_profit"),
    ("净利润同比增长率", "net_profit_yoy"),
    ("扣非净利润", "net_profit_dedt"),
    ("扣非净利润同比增长率", "net_profit_dedt_yoy"),
    ("营业总收入", "total_revenue"),
    ("营业总收入同比增长率", "revenue_yoy"),
    // per share
    ("基本每股收益", "eps"),
    ("每股净资产", "bps"),
    ("每股资本公积金", "capital_reserve_ps"),
    ("每股未分配利润", "undistributed_profit_ps"),
    ("每股经营现金流", "operating_cash_flow_ps"),
    // ratios
    ("销售净利率", "net_profit_margin"),
    ("销售毛利率", "gross_profit_margin"),
    ("净资产收益率", "roe"),
    ("净资产收益 率", "roe"),
    ("净资产收益率-摊薄", "roe_diluted"),
    ("流动比率", "current_ratio"),
    ("速动比率", "quick_ratio"),
    ("保守速动比率", "conservative_quick_ratio"),
    ("产权比率", "equity_ratio"),
    ("资产负债率", "debt_to_assets_ratio"),
    // operating efficiency
    ("营业周期", "operating_cycle"),
    ("存货周转率", "inventory_turnover"),
    ("存货周转天数", "inventory_turnover_days"),
    ("应收账款周转天数", "receivables_turnover_days"),
];

/// Canonical financial metric columns, in file order.
pub const FINANCIAL_COLUMNS: &[&str] = &[
    "net_profit",
    "net_profit_yoy",
    "net_profit_dedt",
    "net_profit_dedt_yoy",
    "total_revenue",
    "revenue_yoy",
    "eps",
    "bps",
    "capital_reserve_ps",
    "undistributed_profit_ps",
    "operating_cash_flow_ps",
    "net_profit_margin",
    "gross_profit_margin",
    "roe",
    "roe_diluted",
    "current_ratio",
    "quick_ratio",
    "conservative_quick_ratio",
    "equity_ratio",
    "debt_to_assets_ratio",
    "operating_cycle",
    "inventory_turnover",
    "inventory_turnover_days",
    "receivables_turnover_days",
];

/// Report period header in THS financial tables.
pub const REPORT_DATE_HEADER: &str = "报告期";

/// Float columns of the price schema, in file order.
pub const PRICE_VALUE_COLUMNS: &[&str] = &[
    "open",
    "high",
    "low",
    "close",
    "pre_close",
    "volume",
    "amount",
    "turnover",
    "pct_chg",
    "amplitude",
    "vwap",
    "pe_ttm",
    "pb_mrq",
    "ps_ttm",
    "pcf_ncf_ttm",
];

pub fn financial_column(header: &str) -> Option<&'static str> {
    let header = header.trim();
    FINANCIAL_MAP
        .iter()
        .find(|(cn, _)| *cn == header)
        .map(|(_, en)| *en)
}

/// Name of the primary date column for a data type.
pub fn date_column(data_type: LakeType) -> &'static str {
    match data_type {
        LakeType::FinancialReport => "report_date",
        _ => "date",
    }
}

/// Expected schema for a data type.
pub fn schema_for(data_type: LakeType) -> Schema {
    let mut fields = vec![
        Field::new("code".into(), DataType::String),
        Field::new(date_column(data_type).into(), DataType::Date),
    ];
    match data_type {
        LakeType::PriceDaily | LakeType::ConceptIndex => {
            fields.extend(
                PRICE_VALUE_COLUMNS
                    .iter()
                    .map(|c| Field::new((*c).into(), DataType::Float64)),
            );
            fields.push(Field::new("trade_status".into(), DataType::Int32));
            fields.push(Field::new("is_st".into(), DataType::Int32));
            fields.push(Field::new("adjust".into(), DataType::String));
            fields.push(Field::new("adjust_gap".into(), DataType::Boolean));
        }
        LakeType::FinancialReport => {
            fields.extend(
                FINANCIAL_COLUMNS
                    .iter()
                    .map(|c| Field::new((*c).into(), DataType::Float64)),
            );
        }
        LakeType::AltData => {
            fields.push(Field::new("item".into(), DataType::String));
            fields.push(Field::new("text".into(), DataType::String));
            fields.push(Field::new("value".into(), DataType::Float64));
        }
    }
    fields.push(Field::new("source".into(), DataType::String));
    Schema::from_iter(fields)
}

/// Columns that must be present in every partition file: `code`, the date
/// column and `source`. Everything else is a nullable value column.
pub fn key_columns(data_type: LakeType) -> [&'static str; 3] {
    ["code", date_column(data_type), "source"]
}

/// Validate a decoded partition against the expected schema.
///
/// Key columns must be present. Value columns may be absent (files written
/// before the column existed) but must have the expected type when present.
pub fn validate(df: &DataFrame, data_type: LakeType) -> Result<(), SchemaError> {
    let expected = schema_for(data_type);
    let actual = df.schema();
    let keys = key_columns(data_type);

    for field in expected.iter_fields() {
        let Some(actual_dtype) = actual.get(field.name()) else {
            if keys.contains(&field.name().as_str()) {
                return Err(SchemaError::MissingColumn(field.name().to_string()));
            }
            continue;
        };
        if actual_dtype != field.dtype() {
            return Err(SchemaError::TypeMismatch {
                column: field.name().to_string(),
                expected: field.dtype().clone(),
                actual: actual_dtype.clone(),
            });
        }
    }
    Ok(())
}

/// Validate `df` and add every absent value column as all-null, so older
/// partitions decode with the current schema.
pub fn conform(mut df: DataFrame, data_type: LakeType) -> Result<DataFrame, SchemaError> {
    validate(&df, data_type)?;
    let height = df.height();
    let missing: Vec<Field> = schema_for(data_type)
        .iter_fields()
        .filter(|f| df.column(f.name()).is_err())
        .collect();
    for field in missing {
        df.with_column(Series::full_null(field.name().clone(), height, field.dtype()))
            .map_err(|e| SchemaError::Fill {
                column: field.name().to_string(),
                reason: e.to_string(),
            })?;
    }
    Ok(df)
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("missing required column: {0}")]
    MissingColumn(String),

    #[error("type mismatch in column {column}: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },

    #[error("cannot fill absent column {column}: {reason}")]
    Fill { column: String, reason: String },
}
