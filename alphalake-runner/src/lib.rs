//! AlphaLake Runner — update orchestration over `alphalake-core`.
//!
//! This crate provides:
//! - The `lake.toml` configuration layer
//! - Task bindings from a task selector to dataset, assets and source passes
//! - The Orchestrator (per-asset pipeline, retries, bounded worker pool, cancellation)
//! - The run manifest, run report and failure policy

pub mod config;
pub mod manifest;
pub mod pipeline;
pub mod retry;
pub mod tasks;

pub use config::{ConfigError, LakeConfig, SourceConfig};
pub use manifest::{AssetOutcome, AssetStatus, FailurePolicy, RunManifest, RunReport, Stage, TaskSummary};
pub use pipeline::{NoProgress, Orchestrator, PipelineState, RunProgress};
pub use retry::RetryPolicy;
pub use tasks::{resolve_tasks, SourceBreakers, Task, TaskKind, TaskSelector, TaskSpec};
