//! AlphaLake Core — the partition-overwrite update engine for an A-share data lake.
//!
//! This crate contains everything below the orchestrator:
//! - Domain types (assets, datasets, partition keys, canonical rows)
//! - Source adapters behind the `SourceAdapter` trait
//! - Normalizer from source-native records to canonical rows
//! - Deduplicator/merger with last-in-fetch-order precedence
//! - Partition planner for full and update runs
//! - Atomic partition writer and reader over year-partitioned Parquet

pub mod data;
pub mod domain;
