//! Orchestrator: runs each task's assets through plan → fetch → normalize →
//! write, folding every per-asset failure into the run manifest.

use crate::config::LakeConfig;
use crate::manifest::{AssetOutcome, AssetStatus, RunManifest, Stage};
use crate::retry::RetryPolicy;
use crate::tasks::Task;
use alphalake_core::data::{
    collapse, DataError, NormalizeOutput, PartitionPlanner, PartitionWriter, RawBatch,
};
use alphalake_core::domain::{Asset, CanonicalRow, DateRange, PartitionKey, RunMode};
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn};

/// Where one asset's pipeline is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Fetching,
    Normalizing,
    Writing,
    Done,
}

/// Callbacks for run progress. All methods default to no-ops.
///
/// With more than one worker, callbacks arrive from pool threads in
/// completion order.
pub trait RunProgress: Send + Sync {
    fn on_task_start(&self, _task: &str, _assets: usize) {}
    fn on_state(&self, _task: &str, _code: &str, _state: PipelineState) {}
    fn on_asset_complete(&self, _outcome: &AssetOutcome) {}
    fn on_task_complete(&self, _task: &str, _outcomes: &[AssetOutcome]) {}
}

/// Progress sink that ignores everything.
pub struct NoProgress;

impl RunProgress for NoProgress {}

pub struct Orchestrator {
    writer: PartitionWriter,
    planner: PartitionPlanner,
    retry: RetryPolicy,
    workers: usize,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(writer: PartitionWriter, planner: PartitionPlanner) -> Self {
        Self {
            writer,
            planner,
            retry: RetryPolicy::default(),
            workers: 1,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(config: &LakeConfig) -> Self {
        Self::new(
            PartitionWriter::new(config.data_dir()),
            PartitionPlanner::new(config.full_start_date),
        )
        .with_retry(config.retry)
        .with_workers(config.workers)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Flag checked between assets. Setting it skips every asset not yet started.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn writer(&self) -> &PartitionWriter {
        &self.writer
    }

    /// Run tasks one after another. `today` fixes the run date for planning.
    pub fn run(
        &self,
        mode: RunMode,
        tasks: &[Task],
        today: NaiveDate,
        progress: &dyn RunProgress,
    ) -> Result<RunManifest> {
        let started_at = Utc::now();
        let pool = if self.workers > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(self.workers)
                    .build()
                    .context("failed to build worker pool")?,
            )
        } else {
            None
        };

        info!(mode = mode.as_str(), %today, tasks = tasks.len(), workers = self.workers, "run started");

        let mut outcomes = Vec::new();
        for task in tasks {
            let task_outcomes = match &pool {
                Some(tp) => tp.install(|| self.run_task_parallel(mode, task, today, progress)),
                None => self.run_task(mode, task, today, progress),
            };
            outcomes.extend(task_outcomes);
        }

        let manifest = RunManifest {
            mode,
            as_of: today,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        let report = manifest.report();
        info!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            elapsed_ms = report.elapsed_ms,
            "run finished"
        );
        Ok(manifest)
    }

    /// Run one task's assets sequentially, in asset order.
    pub fn run_task(
        &self,
        mode: RunMode,
        task: &Task,
        today: NaiveDate,
        progress: &dyn RunProgress,
    ) -> Vec<AssetOutcome> {
        progress.on_task_start(&task.name, task.assets.len());
        let outcomes: Vec<AssetOutcome> = task
            .assets
            .iter()
            .map(|asset| self.run_one(mode, task, asset, today, progress))
            .collect();
        self.finish_task(task, &outcomes, progress);
        outcomes
    }

    /// Same as [`run_task`](Self::run_task) with one asset per work item on
    /// the current rayon pool. Outcomes keep asset order.
    fn run_task_parallel(
        &self,
        mode: RunMode,
        task: &Task,
        today: NaiveDate,
        progress: &dyn RunProgress,
    ) -> Vec<AssetOutcome> {
        progress.on_task_start(&task.name, task.assets.len());
        let outcomes: Vec<AssetOutcome> = task
            .assets
            .par_iter()
            .map(|asset| self.run_one(mode, task, asset, today, progress))
            .collect();
        self.finish_task(task, &outcomes, progress);
        outcomes
    }

    fn finish_task(&self, task: &Task, outcomes: &[AssetOutcome], progress: &dyn RunProgress) {
        let failed = outcomes.iter().filter(|o| o.status.is_failed()).count();
        let skipped = outcomes.iter().filter(|o| o.status.is_skipped()).count();
        if failed > 0 {
            warn!(task = %task.name, failed, total = outcomes.len(), "task finished with failures");
        } else {
            info!(task = %task.name, skipped, total = outcomes.len(), "task finished");
        }
        progress.on_task_complete(&task.name, outcomes);
    }

    fn run_one(
        &self,
        mode: RunMode,
        task: &Task,
        asset: &Asset,
        today: NaiveDate,
        progress: &dyn RunProgress,
    ) -> AssetOutcome {
        if self.cancel.load(Ordering::Relaxed) {
            let outcome = AssetOutcome::skipped(&task.name, &asset.code, "cancelled");
            progress.on_asset_complete(&outcome);
            return outcome;
        }

        let span = info_span!("asset", task = %task.name, code = %asset.code);
        let _guard = span.enter();

        let start = Instant::now();
        let mut outcome = AssetOutcome::new(&task.name, &asset.code);
        self.run_asset(mode, task, asset, today, progress, &mut outcome);
        outcome.elapsed_ms = start.elapsed().as_millis() as u64;

        if let AssetStatus::Failed { stage, error } = &outcome.status {
            error!(%stage, %error, "asset failed");
        }
        progress.on_state(&task.name, &asset.code, PipelineState::Done);
        progress.on_asset_complete(&outcome);
        outcome
    }

    fn run_asset(
        &self,
        mode: RunMode,
        task: &Task,
        asset: &Asset,
        today: NaiveDate,
        progress: &dyn RunProgress,
        outcome: &mut AssetOutcome,
    ) {
        let data_type = task.dataset.data_type();
        let plan = self.planner.plan(mode, data_type, asset, today);
        if plan.is_empty() {
            outcome.skip("no partitions planned");
            return;
        }
        debug!(window = %plan.window, partitions = plan.keys.len(), "planned");

        // Fetch
        progress.on_state(&task.name, &asset.code, PipelineState::Fetching);
        if let Some(blocked) = task.sources.iter().find(|s| !s.is_available()) {
            outcome.fail(
                Stage::Fetch,
                DataError::unavailable(blocked.name(), "circuit breaker open"),
            );
            return;
        }
        let batches = match self.fetch_passes(task, asset, plan.window) {
            Ok(Some(batches)) => batches,
            Ok(None) => {
                outcome.skip("not found upstream");
                return;
            }
            Err(e) => {
                outcome.fail(Stage::Fetch, e);
                return;
            }
        };

        // Normalize
        progress.on_state(&task.name, &asset.code, PipelineState::Normalizing);
        let raw_records: usize = batches.iter().map(RawBatch::len).sum();
        let mut normalized = NormalizeOutput::default();
        for batch in &batches {
            normalized.extend(task.normalizer.normalize(asset, data_type, batch));
        }
        outcome.rows_dropped = normalized.dropped();
        outcome.adjust_gaps = normalized.adjust_gaps;
        if normalized.rows.is_empty() && raw_records > 0 {
            let first = normalized
                .issues
                .iter()
                .find(|i| i.dropped)
                .map(|i| i.error.to_string())
                .unwrap_or_default();
            outcome.fail(
                Stage::Normalize,
                format!("all {raw_records} records rejected; first: {first}"),
            );
            return;
        }
        if outcome.rows_dropped > 0 {
            warn!(dropped = outcome.rows_dropped, records = raw_records, "rows dropped during normalization");
        }

        let mut by_key: BTreeMap<PartitionKey, Vec<CanonicalRow>> = BTreeMap::new();
        for row in normalized.rows {
            let key = row.partition_key();
            if plan.contains(key) {
                by_key.entry(key).or_default().push(row);
            } else {
                outcome.rows_out_of_plan += 1;
            }
        }
        if by_key.is_empty() {
            outcome.skip("no rows in planned partitions");
            return;
        }

        // Write
        progress.on_state(&task.name, &asset.code, PipelineState::Writing);
        for (key, rows) in by_key {
            let merged = collapse(rows);
            outcome.duplicates_collapsed += merged.superseded;
            match self.writer.commit(&task.dataset, &asset.code, key, &merged.rows) {
                Ok(receipt) => {
                    info!(partition = %key, rows = receipt.rows, "partition written");
                    outcome.rows_written += receipt.rows;
                    outcome.partitions_written.push(key);
                    outcome.receipts.push(receipt);
                }
                Err(e) => {
                    outcome.fail(Stage::Write, e);
                    return;
                }
            }
        }
    }

    /// Fetch every source pass over `window`, in pass order.
    ///
    /// `Ok(None)` when every pass answered not-found. Any other error after
    /// retries fails the asset, since a missing pass may hold revisions.
    fn fetch_passes(
        &self,
        task: &Task,
        asset: &Asset,
        window: DateRange,
    ) -> Result<Option<Vec<RawBatch>>, DataError> {
        let mut batches = Vec::with_capacity(task.sources.len());
        let mut found = false;
        for source in &task.sources {
            match self.retry.run(&asset.code, || source.fetch(asset, window)) {
                Ok(batch) => {
                    debug!(source = source.name(), records = batch.len(), "fetched");
                    found = true;
                    batches.push(batch);
                }
                Err(DataError::AssetNotFound { .. }) => {
                    debug!(source = source.name(), "not found upstream");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(found.then_some(batches))
    }
}
