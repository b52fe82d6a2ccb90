//! Asset universe: which stocks, indices, ETFs, concept boards and
//! alternative-data series the lake tracks.
//!
//! Stored as TOML. The stock list can additionally be read from a CSV file
//! with a `code` column (a full-market listing including delisted names);
//! index codes that appear in such listings are filtered out.

use super::normalize::AltBinding;
use crate::domain::{is_index_code, Asset, AssetKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("read universe file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("parse universe file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("read stock list {path}: {reason}")]
    StockList { path: PathBuf, reason: String },
}

/// A listed security with an optional display name and first listing year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedEntry {
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub listed_year: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSection {
    #[serde(default)]
    pub codes: Vec<String>,
    /// CSV with a `code` column, relative to the universe file.
    #[serde(default)]
    pub list_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Universe {
    #[serde(default)]
    pub stocks: StockSection,
    #[serde(default)]
    pub indices: Vec<ListedEntry>,
    #[serde(default)]
    pub etfs: Vec<ListedEntry>,
    #[serde(default)]
    pub concepts: Vec<ListedEntry>,
    /// Alternative-data series name → column bindings.
    #[serde(default)]
    pub alt: BTreeMap<String, AltBinding>,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct StockListRow {
    code: String,
}

impl Universe {
    /// Load a universe from a TOML file. Relative paths inside it resolve
    /// against the file's directory.
    pub fn from_file(path: &Path) -> Result<Self, UniverseError> {
        let content = std::fs::read_to_string(path).map_err(|e| UniverseError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut universe: Universe = toml::from_str(&content).map_err(|e| UniverseError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        universe.base_dir = path.parent().map(Path::to_path_buf);
        Ok(universe)
    }

    /// Parse a universe from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, UniverseError> {
        toml::from_str(content).map_err(|e| UniverseError::Parse {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })
    }

    /// Stock assets: inline codes plus the list file, deduplicated, sorted,
    /// index codes removed.
    pub fn stocks(&self) -> Result<Vec<Asset>, UniverseError> {
        let mut codes: BTreeSet<String> = self.stocks.codes.iter().cloned().collect();

        if let Some(list) = &self.stocks.list_file {
            let path = match &self.base_dir {
                Some(base) if list.is_relative() => base.join(list),
                _ => list.clone(),
            };
            let list_err = |reason: String| UniverseError::StockList {
                path: path.clone(),
                reason,
            };
            let mut reader = csv::Reader::from_path(&path).map_err(|e| list_err(e.to_string()))?;
            for row in reader.deserialize::<StockListRow>() {
                let row = row.map_err(|e| list_err(e.to_string()))?;
                codes.insert(row.code.trim().to_string());
            }
        }

        Ok(codes
            .into_iter()
            .filter(|c| !c.is_empty() && !is_index_code(c))
            .map(|c| Asset::new(c, AssetKind::Stock))
            .collect())
    }

    pub fn indices(&self) -> Vec<Asset> {
        Self::listed(&self.indices, AssetKind::Index)
    }

    pub fn etfs(&self) -> Vec<Asset> {
        Self::listed(&self.etfs, AssetKind::Etf)
    }

    pub fn concepts(&self) -> Vec<Asset> {
        Self::listed(&self.concepts, AssetKind::Concept)
    }

    /// One asset per alternative-data series; the series name is its code.
    pub fn alt_series(&self) -> Vec<(Asset, AltBinding)> {
        self.alt
            .iter()
            .map(|(name, binding)| (Asset::new(name, AssetKind::Alt), binding.clone()))
            .collect()
    }

    /// Configured entries in order, first occurrence of each code kept.
    fn listed(entries: &[ListedEntry], kind: AssetKind) -> Vec<Asset> {
        let mut seen = BTreeSet::new();
        entries
            .iter()
            .filter(|e| seen.insert(e.code.as_str()))
            .map(|e| {
                let mut asset = Asset::new(e.code.clone(), kind);
                asset.name = e.name.clone();
                asset.listed_year = e.listed_year;
                asset
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[stocks]
codes = ["sh.600519", "sz.000001", "sh.000001", "sh.600519"]

[[indices]]
code = "sh.000300"
name = "沪深300"

[[etfs]]
code = "sh.510300"
name = "HS300"
listed_year = 2012

[[concepts]]
code = "BK0574"

[alt.industry_pe]
date_column = "变动日期"
item_column = "行业名称"
value_column = "静态市盈率-加权平均"
"#;

    #[test]
    fn parses_all_sections() {
        let u = Universe::from_toml(SAMPLE).unwrap();
        let stocks = u.stocks().unwrap();
        assert_eq!(
            stocks.iter().map(|a| a.code.as_str()).collect::<Vec<_>>(),
            vec!["sh.600519", "sz.000001"]
        );
        assert_eq!(u.indices()[0].kind, AssetKind::Index);
        assert_eq!(u.etfs()[0].listed_year, Some(2012));
        assert_eq!(u.concepts()[0].code, "BK0574");

        let alt = u.alt_series();
        assert_eq!(alt[0].0.code, "industry_pe");
        assert_eq!(alt[0].1.date_column, "变动日期");
        assert_eq!(alt[0].1.text_column, None);
    }

    #[test]
    fn repeated_listed_codes_keep_first_entry() {
        let u = Universe::from_toml(
            r#"
[[indices]]
code = "sh.000300"
name = "沪深300"

[[indices]]
code = "sh.000300"

[[etfs]]
code = "sh.510300"
listed_year = 2012

[[etfs]]
code = "sz.159915"

[[etfs]]
code = "sh.510300"
listed_year = 2020
"#,
        )
        .unwrap();

        let indices = u.indices();
        assert_eq!(indices.len(), 1);
        assert_eq!(indices[0].name.as_deref(), Some("沪深300"));

        let etfs = u.etfs();
        let codes: Vec<_> = etfs.iter().map(|a| a.code.as_str()).collect();
        assert_eq!(codes, vec!["sh.510300", "sz.159915"]);
        assert_eq!(etfs[0].listed_year, Some(2012));
    }

    #[test]
    fn stock_list_file_resolves_relative_to_universe() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("stocks.csv"),
            "code,code_name\nsh.600000,浦发银行\nsz.399001,深证成指\nbj.430047,诺思兰德\n",
        )
        .unwrap();
        let path = dir.path().join("universe.toml");
        std::fs::write(&path, "[stocks]\ncodes = [\"sh.600519\"]\nlist_file = \"stocks.csv\"\n").unwrap();

        let u = Universe::from_file(&path).unwrap();
        let codes: Vec<_> = u.stocks().unwrap().into_iter().map(|a| a.code).collect();
        assert_eq!(codes, vec!["bj.430047", "sh.600000", "sh.600519"]);
    }

    #[test]
    fn bad_toml_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("universe.toml");
        std::fs::write(&path, "[[etfs]]\nname = 3\n").unwrap();
        let err = Universe::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("universe.toml"));
    }
}
