//! Eastmoney daily kline source.
//!
//! Fetches daily bars for A-share stocks, indices, ETFs and concept boards from
//! the public `push2his` kline endpoint. Back-adjusted (后复权) series are
//! requested for stocks and ETFs by default, so already-written history never
//! needs to be rescaled after a dividend or split.
//!
//! The endpoint is unofficial and unannounced format changes do happen; the
//! CSV drop-directory source is the fallback when it misbehaves.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{DataError, RawBatch, RawRecord, SourceAdapter};
use crate::domain::{Adjust, Asset, AssetKind, DateRange};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

pub const SOURCE_NAME: &str = "eastmoney";

/// Kline API response envelope.
#[derive(Debug, Deserialize)]
struct KlineResponse {
    #[serde(default)]
    rc: Option<i64>,
    data: Option<KlineData>,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    #[serde(default)]
    klines: Vec<String>,
}

/// Connection settings for the Eastmoney source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EastmoneyConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Adjustment mode override. When unset, stocks and ETFs are back-adjusted
    /// and everything else is raw.
    #[serde(default)]
    pub adjust: Option<Adjust>,
    /// Minimum spacing between requests, shared by all workers.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://push2his.eastmoney.com".to_string()
}

fn default_min_interval_ms() -> u64 {
    500
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for EastmoneyConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            adjust: None,
            min_interval_ms: default_min_interval_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

pub struct EastmoneySource {
    client: reqwest::blocking::Client,
    config: EastmoneyConfig,
    circuit_breaker: Arc<CircuitBreaker>,
    last_request: Mutex<Option<Instant>>,
}

impl EastmoneySource {
    /// Build the source and its HTTP session. The session lives as long as
    /// this instance, i.e. one run.
    pub fn new(config: EastmoneyConfig, circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| DataError::unavailable(SOURCE_NAME, format!("http client: {e}")))?;

        Ok(Self {
            client,
            config,
            circuit_breaker,
            last_request: Mutex::new(None),
        })
    }

    pub fn adjust_for(&self, asset: &Asset) -> Adjust {
        self.config.adjust.unwrap_or(match asset.kind {
            AssetKind::Stock | AssetKind::Etf => Adjust::Back,
            _ => Adjust::None,
        })
    }

    /// Eastmoney security id: `{market}.{symbol}`.
    pub fn secid(asset: &Asset) -> Option<String> {
        if asset.kind == AssetKind::Concept {
            return asset
                .code
                .starts_with("BK")
                .then(|| format!("90.{}", asset.code));
        }
        let market = match asset.exchange()? {
            "sh" => 1,
            "sz" | "bj" => 0,
            _ => return None,
        };
        Some(format!("{market}.{}", asset.symbol()))
    }

    fn fqt(adjust: Adjust) -> u8 {
        match adjust {
            Adjust::None => 0,
            Adjust::Forward => 1,
            Adjust::Back => 2,
        }
    }

    fn kline_url(&self, secid: &str, adjust: Adjust, range: DateRange) -> String {
        format!(
            "{base}/api/qt/stock/kline/get?secid={secid}\
             &fields1=f1,f2,f3,f4,f5,f6\
             &fields2=f51,f52,f53,f54,f55,f56,f57,f58,f59,f60,f61\
             &klt=101&fqt={fqt}&beg={beg}&end={end}",
            base = self.config.base_url.trim_end_matches('/'),
            fqt = Self::fqt(adjust),
            beg = range.start.format("%Y%m%d"),
            end = range.end.format("%Y%m%d"),
        )
    }

    /// Space requests at least `min_interval_ms` apart across all workers.
    fn throttle(&self) {
        let min_interval = Duration::from_millis(self.config.min_interval_ms);
        let mut last = self.last_request.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < min_interval {
                std::thread::sleep(min_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }

    fn parse_body(code: &str, body: &str, adjust: Adjust) -> Result<RawBatch, DataError> {
        let resp: KlineResponse = serde_json::from_str(body).map_err(|e| {
            DataError::unavailable(SOURCE_NAME, format!("response format changed for {code}: {e}"))
        })?;
        Self::parse_response(code, resp, adjust)
    }

    fn parse_response(code: &str, resp: KlineResponse, adjust: Adjust) -> Result<RawBatch, DataError> {
        let data = match resp.data {
            Some(data) => data,
            None => {
                debug!(code, rc = ?resp.rc, "eastmoney returned no data");
                return Err(DataError::not_found(code));
            }
        };

        let records = data
            .klines
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .map(|line| RawRecord::EastmoneyKline { line, adjust })
            .collect();

        Ok(RawBatch::new(SOURCE_NAME, records))
    }
}

impl SourceAdapter for EastmoneySource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn fetch(&self, asset: &Asset, range: DateRange) -> Result<RawBatch, DataError> {
        if !self.circuit_breaker.is_allowed() {
            debug!(
                code = %asset.code,
                cooldown_secs = self.circuit_breaker.remaining_cooldown().as_secs(),
                "eastmoney breaker open, request skipped"
            );
            return Err(DataError::CircuitBreakerTripped);
        }

        let secid = Self::secid(asset).ok_or_else(|| DataError::not_found(&asset.code))?;
        let adjust = self.adjust_for(asset);
        let url = self.kline_url(&secid, adjust, range);

        self.throttle();
        debug!(code = %asset.code, %range, "eastmoney request");

        let resp = self.client.get(&url).send().map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                self.circuit_breaker.record_failure();
            }
            DataError::unavailable(SOURCE_NAME, e.to_string())
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            self.circuit_breaker.trip();
            return Err(DataError::CircuitBreakerTripped);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DataError::not_found(&asset.code));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            self.circuit_breaker.record_failure();
            return Err(DataError::unavailable(SOURCE_NAME, format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(DataError::unavailable(SOURCE_NAME, format!("HTTP {status}")));
        }

        let body = resp
            .text()
            .map_err(|e| DataError::unavailable(SOURCE_NAME, format!("read body: {e}")))?;
        let batch = Self::parse_body(&asset.code, &body, adjust)?;
        self.circuit_breaker.record_success();
        Ok(batch)
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}
