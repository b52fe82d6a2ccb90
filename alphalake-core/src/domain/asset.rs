//! Asset: a tracked entity in the lake (stock, index, ETF, concept board, alt series).

use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of entity an asset code refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Stock,
    Index,
    Etf,
    /// Sector / concept board index (e.g. `BK0574`).
    Concept,
    /// Alternative-data series (e.g. `cctv_news`).
    Alt,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Stock => "stock",
            AssetKind::Index => "index",
            AssetKind::Etf => "etf",
            AssetKind::Concept => "concept",
            AssetKind::Alt => "alt",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured asset. Immutable once loaded from the universe.
///
/// `code` is exchange-qualified for listed securities (`sh.600519`, `sz.000001`,
/// `bj.430047`), a board code for concepts (`BK0574`), or the series name for
/// alt data (`cctv_news`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    pub code: String,
    pub kind: AssetKind,
    #[serde(default)]
    pub name: Option<String>,
    /// First year with data upstream. Bounds full-mode planning.
    #[serde(default)]
    pub listed_year: Option<i32>,
}

impl Asset {
    pub fn new(code: impl Into<String>, kind: AssetKind) -> Self {
        Self {
            code: code.into(),
            kind,
            name: None,
            listed_year: None,
        }
    }

    pub fn with_listed_year(mut self, year: i32) -> Self {
        self.listed_year = Some(year);
        self
    }

    /// Exchange prefix (`sh`, `sz`, `bj`) if the code is exchange-qualified.
    pub fn exchange(&self) -> Option<&str> {
        let (prefix, rest) = self.code.split_once('.')?;
        match prefix {
            "sh" | "sz" | "bj" if !rest.is_empty() => Some(prefix),
            _ => None,
        }
    }

    /// Bare symbol without the exchange prefix: `sh.600519` → `600519`.
    pub fn symbol(&self) -> &str {
        match self.exchange() {
            Some(prefix) => &self.code[prefix.len() + 1..],
            None => &self.code,
        }
    }

    /// Deterministic file stem for this asset's partition files.
    pub fn file_stem(&self) -> String {
        file_stem(&self.code)
    }
}

/// Map an asset code to a filesystem-safe stem. Path separators and `:` are
/// replaced so a code can never escape its partition directory.
pub fn file_stem(code: &str) -> String {
    code.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

/// Index codes that show up in full-market stock listings and must be
/// filtered out of the stock universe.
pub fn is_index_code(code: &str) -> bool {
    code.starts_with("sh.000") || code.starts_with("sz.399")
}
