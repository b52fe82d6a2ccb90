//! Run manifest, per-task report and failure policy.

use alphalake_core::data::CommitReceipt;
use alphalake_core::domain::{PartitionKey, RunMode};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Pipeline stage an asset failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Normalize,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Fetch => "fetch",
            Stage::Normalize => "normalize",
            Stage::Write => "write",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AssetStatus {
    Succeeded,
    Failed { stage: Stage, error: String },
    Skipped { reason: String },
}

impl AssetStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, AssetStatus::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, AssetStatus::Skipped { .. })
    }
}

/// What happened to one asset of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetOutcome {
    pub task: String,
    pub code: String,
    pub status: AssetStatus,
    /// Partitions committed, even when a later partition of the same asset failed.
    pub partitions_written: Vec<PartitionKey>,
    pub receipts: Vec<CommitReceipt>,
    pub rows_written: usize,
    /// Rows dropped by the Normalizer.
    pub rows_dropped: usize,
    /// Rows that lost a key collision during merge.
    pub duplicates_collapsed: usize,
    /// Rows outside the planned partitions, discarded before writing.
    pub rows_out_of_plan: usize,
    pub adjust_gaps: usize,
    pub elapsed_ms: u64,
}

impl AssetOutcome {
    pub fn new(task: &str, code: &str) -> Self {
        Self {
            task: task.to_string(),
            code: code.to_string(),
            status: AssetStatus::Succeeded,
            partitions_written: Vec::new(),
            receipts: Vec::new(),
            rows_written: 0,
            rows_dropped: 0,
            duplicates_collapsed: 0,
            rows_out_of_plan: 0,
            adjust_gaps: 0,
            elapsed_ms: 0,
        }
    }

    pub fn skipped(task: &str, code: &str, reason: impl Into<String>) -> Self {
        let mut outcome = Self::new(task, code);
        outcome.status = AssetStatus::Skipped {
            reason: reason.into(),
        };
        outcome
    }

    pub fn fail(&mut self, stage: Stage, error: impl fmt::Display) {
        self.status = AssetStatus::Failed {
            stage,
            error: error.to_string(),
        };
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = AssetStatus::Skipped {
            reason: reason.into(),
        };
    }
}

/// Full record of a run: one outcome per (task, asset), in task then asset order.
#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub mode: RunMode,
    pub as_of: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<AssetOutcome>,
}

impl RunManifest {
    pub fn failures(&self) -> impl Iterator<Item = &AssetOutcome> {
        self.outcomes.iter().filter(|o| o.status.is_failed())
    }

    pub fn report(&self) -> RunReport {
        let mut tasks: BTreeMap<&str, TaskSummary> = BTreeMap::new();
        let mut order: Vec<&str> = Vec::new();
        for o in &self.outcomes {
            let summary = tasks.entry(o.task.as_str()).or_insert_with(|| {
                order.push(o.task.as_str());
                TaskSummary::new(&o.task)
            });
            summary.add(o);
        }
        let tasks: Vec<TaskSummary> = order
            .into_iter()
            .filter_map(|name| tasks.remove(name))
            .collect();

        let elapsed = self.finished_at - self.started_at;
        RunReport {
            mode: self.mode,
            as_of: self.as_of,
            total: tasks.iter().map(|t| t.total).sum(),
            succeeded: tasks.iter().map(|t| t.succeeded).sum(),
            failed: tasks.iter().map(|t| t.failed).sum(),
            skipped: tasks.iter().map(|t| t.skipped).sum(),
            elapsed_ms: elapsed.num_milliseconds().max(0) as u64,
            tasks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub task: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub partitions_written: usize,
    pub rows_written: usize,
    pub rows_dropped: usize,
    pub duplicates_collapsed: usize,
}

impl TaskSummary {
    fn new(task: &str) -> Self {
        Self {
            task: task.to_string(),
            total: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            partitions_written: 0,
            rows_written: 0,
            rows_dropped: 0,
            duplicates_collapsed: 0,
        }
    }

    fn add(&mut self, o: &AssetOutcome) {
        self.total += 1;
        match o.status {
            AssetStatus::Succeeded => self.succeeded += 1,
            AssetStatus::Failed { .. } => self.failed += 1,
            AssetStatus::Skipped { .. } => self.skipped += 1,
        }
        self.partitions_written += o.partitions_written.len();
        self.rows_written += o.rows_written;
        self.rows_dropped += o.rows_dropped;
        self.duplicates_collapsed += o.duplicates_collapsed;
    }
}

/// Aggregate counts: "N of M assets failed" per task and overall.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub as_of: NaiveDate,
    pub tasks: Vec<TaskSummary>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub elapsed_ms: u64,
}

/// Decides whether a run's failures make the process exit non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FailurePolicy {
    /// Failed assets tolerated. 0 means any failure fails the run.
    #[serde(default)]
    pub max_failed: usize,
    /// When set, replaces `max_failed` with a fraction of all assets.
    #[serde(default)]
    pub max_failed_ratio: Option<f64>,
}

impl FailurePolicy {
    pub fn should_fail(&self, report: &RunReport) -> bool {
        match self.max_failed_ratio {
            Some(ratio) if report.total > 0 => report.failed as f64 / report.total as f64 > ratio,
            Some(_) => false,
            None => report.failed > self.max_failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(outcomes: Vec<AssetOutcome>) -> RunManifest {
        let now = Utc::now();
        RunManifest {
            mode: RunMode::Update,
            as_of: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            started_at: now,
            finished_at: now,
            outcomes,
        }
    }

    fn failed(task: &str, code: &str) -> AssetOutcome {
        let mut o = AssetOutcome::new(task, code);
        o.fail(Stage::Fetch, "source 'eastmoney' unavailable: timeout");
        o
    }

    #[test]
    fn report_counts_per_task_in_run_order() {
        let mut ok = AssetOutcome::new("stock", "sh.600519");
        ok.partitions_written = vec![PartitionKey(2025)];
        ok.rows_written = 45;
        let m = manifest(vec![
            ok,
            failed("stock", "sz.000001"),
            AssetOutcome::skipped("stock", "sh.688999", "not found upstream"),
            AssetOutcome::new("etf", "sh.510300"),
        ]);

        let report = m.report();
        assert_eq!(report.tasks.len(), 2);
        assert_eq!(report.tasks[0].task, "stock");
        assert_eq!(report.tasks[0].total, 3);
        assert_eq!(report.tasks[0].failed, 1);
        assert_eq!(report.tasks[0].skipped, 1);
        assert_eq!(report.tasks[0].rows_written, 45);
        assert_eq!(report.tasks[1].task, "etf");
        assert_eq!((report.total, report.succeeded, report.failed, report.skipped), (4, 2, 1, 1));
        assert_eq!(m.failures().count(), 1);
    }

    #[test]
    fn failure_policy_count_and_ratio() {
        let m = manifest(vec![
            failed("stock", "a"),
            AssetOutcome::new("stock", "b"),
            AssetOutcome::new("stock", "c"),
            AssetOutcome::new("stock", "d"),
        ]);
        let report = m.report();

        assert!(FailurePolicy::default().should_fail(&report));
        let lenient = FailurePolicy {
            max_failed: 1,
            max_failed_ratio: None,
        };
        assert!(!lenient.should_fail(&report));

        let ratio = |r| FailurePolicy {
            max_failed: 0,
            max_failed_ratio: Some(r),
        };
        assert!(!ratio(0.25).should_fail(&report));
        assert!(ratio(0.2).should_fail(&report));
    }

    #[test]
    fn skipped_assets_never_fail_the_run() {
        let m = manifest(vec![AssetOutcome::skipped("alt_cctv_news", "cctv_news", "not found upstream")]);
        assert!(!FailurePolicy::default().should_fail(&m.report()));
    }

    #[test]
    fn outcome_serializes_status_tag() {
        let json = serde_json::to_value(failed("stock", "sz.000001")).unwrap();
        assert_eq!(json["status"]["status"], "failed");
        assert_eq!(json["status"]["stage"], "fetch");
    }
}
