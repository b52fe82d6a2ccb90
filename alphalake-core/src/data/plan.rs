//! PartitionPlanner: which partitions a run rebuilds, and the fetch window
//! that covers them.
//!
//! Pure function of (mode, data type, asset, run date). The run date is
//! injected so year-boundary behaviour is reproducible.

use crate::domain::{Asset, DataType, DateRange, PartitionKey, RunMode};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::BTreeSet;

/// First trading day of the Shanghai Stock Exchange.
pub fn default_full_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(1990, 12, 19).unwrap_or_default()
}

/// Month (1-based) from which the previous fiscal year's annual reports are
/// considered settled.
const ANNUAL_REPORT_DEADLINE_MONTH: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionPlan {
    /// Partitions to rebuild, ascending. Every one is rewritten in full.
    pub keys: BTreeSet<PartitionKey>,
    /// Inclusive fetch window covering all of `keys` up to the run date.
    pub window: DateRange,
}

impl PartitionPlan {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: PartitionKey) -> bool {
        self.keys.contains(&key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPlanner {
    full_start: NaiveDate,
}

impl Default for PartitionPlanner {
    fn default() -> Self {
        Self::new(default_full_start())
    }
}

impl PartitionPlanner {
    pub fn new(full_start: NaiveDate) -> Self {
        Self { full_start }
    }

    pub fn full_start(&self) -> NaiveDate {
        self.full_start
    }

    pub fn plan(&self, mode: RunMode, data_type: DataType, asset: &Asset, today: NaiveDate) -> PartitionPlan {
        let this_year = today.year();
        let keys: BTreeSet<PartitionKey> = match mode {
            RunMode::Full => {
                let first = asset
                    .listed_year
                    .map_or(self.full_start.year(), |y| y.max(self.full_start.year()));
                (first..=this_year).map(PartitionKey).collect()
            }
            RunMode::Update => {
                let mut keys = BTreeSet::from([PartitionKey(this_year)]);
                // Last year's annual reports keep landing until the end of April.
                if data_type.is_report_frequency() && today.month() < ANNUAL_REPORT_DEADLINE_MONTH {
                    keys.insert(PartitionKey(this_year - 1));
                }
                keys
            }
        };

        let start = keys
            .first()
            .and_then(|k| k.first_day())
            .map_or(today, |d| d.max(self.full_start));
        let window = if keys.is_empty() {
            // Nothing to rebuild: an empty (inverted) window.
            DateRange::new(today + chrono::Duration::days(1), today)
        } else {
            DateRange::new(start, today)
        };

        PartitionPlan { keys, window }
    }
}
