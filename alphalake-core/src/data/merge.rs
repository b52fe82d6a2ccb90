//! Deduplicator/Merger.
//!
//! Collapses key-colliding rows with a single precedence rule: the row that
//! comes later in input order wins. Output is sorted by key so a partition's
//! serialized form depends only on its logical content.

use crate::domain::{CanonicalRow, RowKey};
use std::collections::BTreeMap;

/// Result of a merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Merged {
    /// One row per key, ascending by key.
    pub rows: Vec<CanonicalRow>,
    /// Rows that lost a key collision.
    pub superseded: usize,
}

/// Merge `new` over `existing`: existing rows first, then new rows, last
/// occurrence per key wins.
pub fn merge(existing: Vec<CanonicalRow>, new: Vec<CanonicalRow>) -> Merged {
    let mut by_key: BTreeMap<RowKey, CanonicalRow> = BTreeMap::new();
    let mut superseded = 0;
    for row in existing.into_iter().chain(new) {
        if by_key.insert(row.key(), row).is_some() {
            superseded += 1;
        }
    }
    Merged {
        rows: by_key.into_values().collect(),
        superseded,
    }
}

/// Deduplicate a single fetch's rows.
pub fn collapse(rows: Vec<CanonicalRow>) -> Merged {
    merge(Vec::new(), rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PriceFields, RowBody};
    use chrono::NaiveDate;

    fn bar(day: u32, close: f64) -> CanonicalRow {
        CanonicalRow {
            code: "sh.600519".into(),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            item: None,
            source: "eastmoney".into(),
            body: RowBody::Price(PriceFields {
                close: Some(close),
                ..Default::default()
            }),
        }
    }

    fn close(row: &CanonicalRow) -> f64 {
        row.price().and_then(|p| p.close).unwrap()
    }

    #[test]
    fn later_fetch_overrides_earlier() {
        let first = vec![bar(1, 1680.0), bar(2, 1690.0)];
        let second = vec![bar(1, 1682.0), bar(3, 1695.0)];
        let merged = collapse(first.into_iter().chain(second).collect());

        assert_eq!(merged.rows.len(), 3);
        assert_eq!(merged.superseded, 1);
        let closes: Vec<f64> = merged.rows.iter().map(close).collect();
        assert_eq!(closes, vec![1682.0, 1690.0, 1695.0]);
    }

    #[test]
    fn new_rows_win_over_existing() {
        let merged = merge(vec![bar(2, 1.0), bar(1, 1.0)], vec![bar(2, 2.0)]);
        assert_eq!(merged.rows.len(), 2);
        assert_eq!(close(&merged.rows[1]), 2.0);
        assert!(merged.rows[0].date < merged.rows[1].date);
    }

    #[test]
    fn empty_in_empty_out() {
        assert_eq!(collapse(Vec::new()), Merged::default());
    }
}
