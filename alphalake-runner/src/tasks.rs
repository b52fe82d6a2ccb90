//! Task bindings: which dataset, assets, source passes and normalizer each
//! task selector runs.

use crate::config::{ConfigError, LakeConfig, SourceConfig};
use alphalake_core::data::{
    AltBinding, CircuitBreaker, CsvDirSource, CsvFormat, DataError, EastmoneyConfig, EastmoneySource,
    Normalizer, SourceAdapter, Universe,
};
use alphalake_core::data::eastmoney::SOURCE_NAME as EASTMONEY;
use alphalake_core::domain::{Asset, AssetKind, DataType, Dataset};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// One independent pipeline: a dataset and the assets written into it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    Stock,
    Index,
    Etf,
    Concept,
    Finance,
    /// One alternative-data series, by name.
    Alt(String),
}

const FIXED_TASKS: [&str; 5] = ["stock", "index", "etf", "concept", "finance"];

impl TaskKind {
    pub fn name(&self) -> String {
        match self {
            TaskKind::Stock => "stock".into(),
            TaskKind::Index => "index".into(),
            TaskKind::Etf => "etf".into(),
            TaskKind::Concept => "concept".into(),
            TaskKind::Finance => "finance".into(),
            TaskKind::Alt(series) => format!("alt_{series}"),
        }
    }

    pub fn dataset(&self) -> Dataset {
        match self {
            TaskKind::Stock => Dataset::stock_price(),
            TaskKind::Index => Dataset::index_price(),
            TaskKind::Etf => Dataset::etf_price(),
            TaskKind::Concept => Dataset::concept_price(),
            TaskKind::Finance => Dataset::stock_financial(),
            TaskKind::Alt(series) => Dataset::alt(series),
        }
    }

    /// Whether `key` may appear under `[sources.<key>]`.
    pub fn is_source_key(key: &str) -> bool {
        FIXED_TASKS.contains(&key)
            || key == "alt"
            || key.strip_prefix("alt_").is_some_and(|series| !series.is_empty())
    }

    /// Config keys consulted for this task's sources, most specific first.
    pub fn source_keys(&self) -> Vec<String> {
        match self {
            TaskKind::Alt(_) => vec![self.name(), "alt".into()],
            _ => vec![self.name()],
        }
    }

    /// Built-in fetch passes when the config names none.
    pub fn default_sources(&self) -> Vec<SourceConfig> {
        match self {
            TaskKind::Stock | TaskKind::Index | TaskKind::Etf | TaskKind::Concept => {
                vec![SourceConfig::Eastmoney(EastmoneyConfig::default())]
            }
            TaskKind::Finance => vec![SourceConfig::CsvDir {
                dir: PathBuf::from("data/raw/ths_financial"),
                format: CsvFormat::ThsFinancial,
            }],
            TaskKind::Alt(_) => vec![SourceConfig::CsvDir {
                dir: PathBuf::from("data/raw/alt"),
                format: CsvFormat::Alt,
            }],
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// `--task` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSelector {
    All,
    /// Every alternative-data series in the universe.
    AllAlt,
    One(TaskKind),
}

impl FromStr for TaskSelector {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Ok(match s.as_str() {
            "all" => TaskSelector::All,
            "alt" => TaskSelector::AllAlt,
            "stock" => TaskSelector::One(TaskKind::Stock),
            "index" => TaskSelector::One(TaskKind::Index),
            "etf" => TaskSelector::One(TaskKind::Etf),
            "concept" => TaskSelector::One(TaskKind::Concept),
            "finance" => TaskSelector::One(TaskKind::Finance),
            other => match other.strip_prefix("alt_") {
                Some(series) if !series.is_empty() => TaskSelector::One(TaskKind::Alt(series.to_string())),
                _ => return Err(ConfigError::UnknownTask(other.to_string())),
            },
        })
    }
}

impl TaskSelector {
    /// Tasks this selector runs, in run order.
    pub fn kinds(&self, universe: &Universe) -> Result<Vec<TaskKind>, ConfigError> {
        let alt = || universe.alt.keys().map(|s| TaskKind::Alt(s.clone()));
        match self {
            TaskSelector::All => {
                let mut kinds = vec![
                    TaskKind::Stock,
                    TaskKind::Index,
                    TaskKind::Etf,
                    TaskKind::Concept,
                    TaskKind::Finance,
                ];
                kinds.extend(alt());
                Ok(kinds)
            }
            TaskSelector::AllAlt => Ok(alt().collect()),
            TaskSelector::One(TaskKind::Alt(series)) if !universe.alt.contains_key(series) => Err(
                ConfigError::Invalid(format!("alternative-data series '{series}' is not in the universe")),
            ),
            TaskSelector::One(kind) => Ok(vec![kind.clone()]),
        }
    }
}

impl SourceConfig {
    /// Whether this source produces raw records the normalizer accepts for `data_type`.
    pub fn supports(&self, data_type: DataType) -> bool {
        match self {
            SourceConfig::Eastmoney(_) => {
                matches!(data_type, DataType::PriceDaily | DataType::ConceptIndex)
            }
            SourceConfig::CsvDir { format, .. } => match format {
                CsvFormat::Baostock => {
                    matches!(data_type, DataType::PriceDaily | DataType::ConceptIndex)
                }
                CsvFormat::ThsFinancial => data_type == DataType::FinancialReport,
                CsvFormat::Alt => data_type == DataType::AltData,
            },
        }
    }

    /// Short description for `lake plan` output.
    pub fn describe(&self) -> String {
        match self {
            SourceConfig::Eastmoney(em) => format!("eastmoney({})", em.base_url),
            SourceConfig::CsvDir { dir, format } => {
                format!("csv_dir:{}({})", format.source_tag(), dir.display())
            }
        }
    }
}

/// A task resolved from config and universe, with nothing connected yet.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub kind: TaskKind,
    pub dataset: Dataset,
    pub assets: Vec<Asset>,
    pub alt_binding: Option<AltBinding>,
    pub sources: Vec<SourceConfig>,
}

impl TaskSpec {
    pub fn name(&self) -> String {
        self.kind.name()
    }

    /// Open each source pass. Sources of the same name share one circuit
    /// breaker across tasks.
    pub fn connect(&self, breakers: &mut SourceBreakers) -> Result<Task, DataError> {
        let mut sources: Vec<Arc<dyn SourceAdapter>> = Vec::with_capacity(self.sources.len());
        for pass in &self.sources {
            let adapter: Arc<dyn SourceAdapter> = match pass {
                SourceConfig::Eastmoney(config) => {
                    let breaker = breakers.get(EASTMONEY);
                    Arc::new(EastmoneySource::new(config.clone(), breaker)?)
                }
                SourceConfig::CsvDir { dir, format } => {
                    let mut source = CsvDirSource::new(dir.clone(), *format);
                    if let (CsvFormat::Alt, Some(binding)) = (format, &self.alt_binding) {
                        source = source.with_date_column(binding.date_column.clone());
                    }
                    Arc::new(source)
                }
            };
            sources.push(adapter);
        }

        let normalizer = match &self.alt_binding {
            Some(binding) => Normalizer::with_alt_binding(binding.clone()),
            None => Normalizer::new(),
        };

        Ok(Task {
            name: self.name(),
            dataset: self.dataset.clone(),
            assets: self.assets.clone(),
            sources,
            normalizer,
        })
    }
}

/// Circuit breakers keyed by source name, created on first use.
#[derive(Default)]
pub struct SourceBreakers {
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
}

impl SourceBreakers {
    pub fn get(&mut self, source: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::for_source(source)))
            .clone()
    }
}

/// A runnable task: the dataset, its assets, the source passes in fetch
/// order, and the normalizer for the dataset's data type.
pub struct Task {
    pub name: String,
    pub dataset: Dataset,
    pub assets: Vec<Asset>,
    pub sources: Vec<Arc<dyn SourceAdapter>>,
    pub normalizer: Normalizer,
}

impl Task {
    pub fn new(name: impl Into<String>, dataset: Dataset, assets: Vec<Asset>) -> Self {
        Self {
            name: name.into(),
            dataset,
            assets,
            sources: Vec::new(),
            normalizer: Normalizer::new(),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn SourceAdapter>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }
}

/// Resolve the selected tasks against the config and universe.
pub fn resolve_tasks(
    config: &LakeConfig,
    universe: &Universe,
    selector: &TaskSelector,
) -> Result<Vec<TaskSpec>, ConfigError> {
    selector
        .kinds(universe)?
        .into_iter()
        .map(|kind| {
            let dataset = kind.dataset();
            let (assets, alt_binding) = match &kind {
                TaskKind::Stock | TaskKind::Finance => (universe.stocks()?, None),
                TaskKind::Index => (universe.indices(), None),
                TaskKind::Etf => (universe.etfs(), None),
                TaskKind::Concept => (universe.concepts(), None),
                TaskKind::Alt(series) => {
                    let binding = universe.alt.get(series).cloned().unwrap_or_default();
                    (
                        vec![Asset::new(series.clone(), AssetKind::Alt)],
                        Some(binding),
                    )
                }
            };

            let sources = config.sources_for(&kind);
            if let Some(bad) = sources.iter().find(|s| !s.supports(dataset.data_type())) {
                return Err(ConfigError::Invalid(format!(
                    "task {kind}: source {} cannot feed {}",
                    bad.describe(),
                    dataset.data_type()
                )));
            }

            Ok(TaskSpec {
                kind,
                dataset,
                assets,
                alt_binding,
                sources,
            })
        })
        .collect()
}
