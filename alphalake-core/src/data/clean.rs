//! Cell-level cleaning helpers shared by the CSV source and the Normalizer.

use chrono::NaiveDate;

/// Upstream "no data" sentinels. These map to null, never to zero.
const PLACEHOLDERS: &[&str] = &["", "-", "--", "None", "none", "nan", "NaN", "null", "False"];

pub fn is_placeholder(s: &str) -> bool {
    PLACEHOLDERS.contains(&s.trim())
}

/// Parse `YYYY-MM-DD`, `YYYYMMDD`, `YYYY/MM/DD`, with or without a trailing time.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    let day = s.split([' ', 'T']).next().unwrap_or(s);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(day, "%Y%m%d"))
        .or_else(|_| NaiveDate::parse_from_str(day, "%Y/%m/%d"))
        .ok()
}

/// Outcome of coercing one numeric cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cell {
    Null,
    Value(f64),
    Invalid,
}

/// Plain numeric cell: placeholder → null, otherwise must parse as a finite float.
pub fn parse_number(s: &str) -> Cell {
    if is_placeholder(s) {
        return Cell::Null;
    }
    match s.trim().replace(',', "").parse::<f64>() {
        Ok(v) if v.is_finite() => Cell::Value(v),
        _ => Cell::Invalid,
    }
}

/// Cell as printed by THS financial tables: `2.53%` → 0.0253, `6.29亿` → 6.29e8,
/// `1.5万` → 1.5e4.
pub fn parse_cn_number(s: &str) -> Cell {
    if is_placeholder(s) {
        return Cell::Null;
    }
    let t = s.trim();
    let (body, scale) = if let Some(b) = t.strip_suffix('%') {
        (b, 0.01)
    } else if let Some(b) = t.strip_suffix("万亿") {
        (b, 1e12)
    } else if let Some(b) = t.strip_suffix('亿') {
        (b, 1e8)
    } else if let Some(b) = t.strip_suffix('万') {
        (b, 1e4)
    } else {
        (t, 1.0)
    };
    match parse_number(body) {
        Cell::Value(v) => Cell::Value(v * scale),
        Cell::Null => Cell::Null,
        Cell::Invalid => Cell::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dates_in_all_upstream_shapes() {
        let expected = NaiveDate::from_ymd_opt(2023, 12, 31);
        assert_eq!(parse_date("2023-12-31"), expected);
        assert_eq!(parse_date("20231231"), expected);
        assert_eq!(parse_date("2023/12/31"), expected);
        assert_eq!(parse_date("2023-12-31 00:00:00"), expected);
        assert_eq!(parse_date("2023-12-31T00:00:00"), expected);
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("2023-13-01"), None);
    }

    #[test]
    fn placeholders_are_null_not_zero() {
        for s in ["", " ", "--", "-", "None", "nan", "False"] {
            assert_eq!(parse_number(s), Cell::Null, "{s:?}");
        }
        assert_eq!(parse_number("0"), Cell::Value(0.0));
        assert_eq!(parse_number("abc"), Cell::Invalid);
        assert_eq!(parse_number("inf"), Cell::Invalid);
        assert_eq!(parse_number("1,234.5"), Cell::Value(1234.5));
    }

    #[test]
    fn chinese_units() {
        assert_eq!(parse_cn_number("6.29亿"), Cell::Value(6.29 * 1e8));
        assert_eq!(parse_cn_number("1.5万"), Cell::Value(15000.0));
        assert_eq!(parse_cn_number("-6.59%"), Cell::Value(-6.59 * 0.01));
        assert_eq!(parse_cn_number("2.1万亿"), Cell::Value(2.1 * 1e12));
        assert_eq!(parse_cn_number("False"), Cell::Null);
        assert_eq!(parse_cn_number("12.5"), Cell::Value(12.5));
        assert_eq!(parse_cn_number("abc亿"), Cell::Invalid);
    }
}
