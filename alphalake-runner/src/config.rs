//! Lake configuration file (`lake.toml`).
//!
//! ```toml
//! data_dir = "data/processed"
//! universe = "universe.toml"
//! full_start_date = "1990-12-19"
//! workers = 4
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 500
//!
//! [failure_policy]
//! max_failed = 0
//!
//! [[sources.stock]]
//! type = "eastmoney"
//!
//! [[sources.finance]]
//! type = "csv_dir"
//! dir = "data/raw/ths_financial"
//! format = "ths_financial"
//! ```
//!
//! Relative paths resolve against the directory holding the config file.

use crate::manifest::FailurePolicy;
use crate::retry::RetryPolicy;
use crate::tasks::TaskKind;
use alphalake_core::data::{default_full_start, CsvFormat, EastmoneyConfig};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("parse config {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Universe(#[from] alphalake_core::data::UniverseError),

    #[error("unknown task selector '{0}' (expected all, stock, index, etf, finance, concept, alt or alt_<series>)")]
    UnknownTask(String),
}

/// One fetch pass of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Eastmoney kline HTTP API.
    Eastmoney(EastmoneyConfig),
    /// Directory of raw per-asset CSV exports.
    CsvDir {
        dir: PathBuf,
        format: CsvFormat,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LakeConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_universe")]
    pub universe: PathBuf,
    #[serde(default = "default_full_start")]
    pub full_start_date: NaiveDate,
    /// Bounded worker pool size. 1 runs assets sequentially.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Task name (`stock`, `finance`, `alt`, `alt_<series>`, ...) → fetch passes, in order.
    #[serde(default)]
    pub sources: BTreeMap<String, Vec<SourceConfig>>,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/processed")
}

fn default_universe() -> PathBuf {
    PathBuf::from("universe.toml")
}

fn default_workers() -> usize {
    1
}

impl Default for LakeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            universe: default_universe(),
            full_start_date: default_full_start(),
            workers: default_workers(),
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
            sources: BTreeMap::new(),
            base_dir: None,
        }
    }
}

impl LakeConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut config: LakeConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a config from a string. Paths stay relative to the
    /// working directory.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: LakeConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if let Some(ratio) = self.failure_policy.max_failed_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ConfigError::Invalid(format!(
                    "failure_policy.max_failed_ratio must be within 0..=1, got {ratio}"
                )));
            }
        }
        for (task, passes) in &self.sources {
            if !TaskKind::is_source_key(task) {
                return Err(ConfigError::Invalid(format!("sources.{task}: unknown task")));
            }
            if passes.is_empty() {
                return Err(ConfigError::Invalid(format!("sources.{task}: no fetch passes")));
            }
        }
        Ok(())
    }

    /// Resolve a possibly relative path against the config file's directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve(&self.data_dir)
    }

    pub fn universe_path(&self) -> PathBuf {
        self.resolve(&self.universe)
    }

    /// Fetch passes for a task: the most specific configured key wins
    /// (`alt_cctv_news` over `alt`), then the built-in default.
    pub fn sources_for(&self, kind: &TaskKind) -> Vec<SourceConfig> {
        let passes = kind
            .source_keys()
            .iter()
            .find_map(|key| self.sources.get(key.as_str()).cloned())
            .unwrap_or_else(|| kind.default_sources());

        passes
            .into_iter()
            .map(|pass| match pass {
                SourceConfig::CsvDir { dir, format } => SourceConfig::CsvDir {
                    dir: self.resolve(&dir),
                    format,
                },
                other => other,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = LakeConfig::from_toml("").unwrap();
        assert_eq!(config, LakeConfig::default());
        assert_eq!(config.full_start_date, NaiveDate::from_ymd_opt(1990, 12, 19).unwrap());
        assert_eq!(config.workers, 1);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.failure_policy.max_failed, 0);
    }

    #[test]
    fn parses_source_passes_in_order() {
        let config = LakeConfig::from_toml(
            r#"
workers = 4

[[sources.stock]]
type = "eastmoney"
min_interval_ms = 200

[[sources.stock]]
type = "csv_dir"
dir = "corrections"
format = "baostock"
"#,
        )
        .unwrap();
        let passes = config.sources_for(&TaskKind::Stock);
        assert_eq!(passes.len(), 2);
        match &passes[0] {
            SourceConfig::Eastmoney(em) => {
                assert_eq!(em.min_interval_ms, 200);
                assert_eq!(em.base_url, "https://push2his.eastmoney.com");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            passes[1],
            SourceConfig::CsvDir {
                dir: PathBuf::from("corrections"),
                format: CsvFormat::Baostock
            }
        );
    }

    #[test]
    fn series_specific_sources_win() {
        let config = LakeConfig::from_toml(
            r#"
[[sources.alt]]
type = "csv_dir"
dir = "alt"
format = "alt"

[[sources.alt_cctv_news]]
type = "csv_dir"
dir = "news"
format = "alt"
"#,
        )
        .unwrap();
        let news = config.sources_for(&TaskKind::Alt("cctv_news".into()));
        let pe = config.sources_for(&TaskKind::Alt("industry_pe".into()));
        assert!(matches!(&news[0], SourceConfig::CsvDir { dir, .. } if dir == Path::new("news")));
        assert!(matches!(&pe[0], SourceConfig::CsvDir { dir, .. } if dir == Path::new("alt")));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            LakeConfig::from_toml("workers = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(LakeConfig::from_toml("[retry]\nmax_attempts = 0").is_err());
        assert!(LakeConfig::from_toml("[failure_policy]\nmax_failed_ratio = 1.5").is_err());
        assert!(LakeConfig::from_toml("[[sources.futures]]\ntype = \"eastmoney\"").is_err());
        assert!(matches!(
            LakeConfig::from_toml("workers = \"many\""),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lake.toml");
        std::fs::write(
            &path,
            "data_dir = \"lake\"\n[[sources.finance]]\ntype = \"csv_dir\"\ndir = \"raw/ths\"\nformat = \"ths_financial\"\n",
        )
        .unwrap();
        let config = LakeConfig::load(&path).unwrap();
        assert_eq!(config.data_dir(), dir.path().join("lake"));
        assert_eq!(config.universe_path(), dir.path().join("universe.toml"));
        assert_eq!(
            config.sources_for(&TaskKind::Finance),
            vec![SourceConfig::CsvDir {
                dir: dir.path().join("raw/ths"),
                format: CsvFormat::ThsFinancial
            }]
        );
    }
}
