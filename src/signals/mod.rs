use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SignalsConfig;

const HOURLY_LIMIT: usize = 336;
const INTRADAY_LIMIT: usize = 60;
const FETCH_ATTEMPTS: u32 = 3;
const FETCH_RETRY_PAUSE: Duration = Duration::from_secs(2);
const ETA_FLOOR: f64 = 0.001;

/// Externally supplied market facts consumed by the pricing engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarketSignals {
    pub sigma: f64,
    pub eta: f64,
    pub trend_alpha: f64,
    pub funding_rate: f64,
    pub rsi: f64,
    pub high_1m: f64,
    pub low_1m: f64,
}

impl Default for MarketSignals {
    fn default() -> Self {
        Self {
            sigma: 0.01,
            eta: 0.01,
            trend_alpha: 0.0,
            funding_rate: 0.0,
            rsi: 50.0,
            high_1m: 0.0,
            low_1m: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub ts_s: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("unsupported signals.source '{0}'; expected 'static' or 'gateio'")]
    InvalidSource(String),
    #[error("http request error: {0}")]
    Http(#[source] Box<reqwest::Error>),
    #[error("candle endpoint returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("json parse error: {0}")]
    Json(#[source] Box<serde_json::Error>),
    #[error("not enough {interval} candles: got {got}")]
    InsufficientData { interval: &'static str, got: usize },
}

impl From<reqwest::Error> for SignalError {
    fn from(error: reqwest::Error) -> Self {
        Self::Http(Box::new(error))
    }
}

impl From<serde_json::Error> for SignalError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(Box::new(error))
    }
}

/// Pull source of [`MarketSignals`]. Failures leave the caller's previous values in place.
#[async_trait]
pub trait SignalService: Send + Sync {
    async fn compute_signals(&self, contract: &str) -> Result<MarketSignals, SignalError>;
}

/// Sample standard deviation of log returns between consecutive closes.
pub fn log_return_volatility(closes: &[f64]) -> Option<f64> {
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|pair| pair[0] > 0.0 && pair[1] > 0.0)
        .map(|pair| (pair[1] / pair[0]).ln())
        .filter(|r| r.is_finite())
        .collect();
    if returns.len() < 2 {
        return None;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt())
}

/// Price change per bar over the trailing `window` bars; zero without enough history.
pub fn trend_slope(closes: &[f64], window: usize) -> f64 {
    let n = closes.len();
    if window == 0 || n <= window {
        return 0.0;
    }
    (closes[n - 1] - closes[n - window]) / window as f64
}

/// RSI from simple means of gains and losses over the last `period` changes.
/// Neutral 50 when undefined.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() <= period {
        return 50.0;
    }

    let tail = &closes[closes.len() - period - 1..];
    let (gain, loss) = tail.windows(2).fold((0.0, 0.0), |(gain, loss), pair| {
        let delta = pair[1] - pair[0];
        if delta > 0.0 {
            (gain + delta, loss)
        } else {
            (gain, loss - delta)
        }
    });
    let avg_gain = gain / period as f64;
    let avg_loss = loss / period as f64;

    if avg_loss == 0.0 {
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }
    let value = 100.0 - 100.0 / (1.0 + avg_gain / avg_loss);
    if value.is_finite() {
        value
    } else {
        50.0
    }
}

/// High and low of the last fully closed candle.
pub fn previous_candle_bounds(candles: &[Candle]) -> Option<(f64, f64)> {
    let n = candles.len();
    if n < 2 {
        return None;
    }
    let candle = candles[n - 2];
    Some((candle.high, candle.low))
}

/// Combines the three candle horizons and the funding rate into one snapshot.
pub fn compute_from_candles(
    hourly: &[Candle],
    five_minute: &[Candle],
    one_minute: &[Candle],
    funding_rate: f64,
    trend_window: usize,
    rsi_period: usize,
) -> Result<MarketSignals, SignalError> {
    let hourly_closes: Vec<f64> = hourly.iter().map(|c| c.close).collect();
    let sigma = log_return_volatility(&hourly_closes).ok_or(SignalError::InsufficientData {
        interval: "1h",
        got: hourly.len(),
    })?;

    let five_closes: Vec<f64> = five_minute.iter().map(|c| c.close).collect();
    let (high_1m, low_1m) = previous_candle_bounds(one_minute).unwrap_or((0.0, 0.0));

    Ok(MarketSignals {
        sigma,
        eta: sigma.max(ETA_FLOOR),
        trend_alpha: trend_slope(&five_closes, trend_window),
        funding_rate,
        rsi: rsi(&five_closes, rsi_period),
        high_1m,
        low_1m,
    })
}

/// Fixed signal values for sandbox runs.
#[derive(Debug, Clone, Default)]
pub struct StaticSignalService {
    signals: MarketSignals,
}

impl StaticSignalService {
    pub fn new(signals: MarketSignals) -> Self {
        Self { signals }
    }
}

#[async_trait]
impl SignalService for StaticSignalService {
    async fn compute_signals(&self, _contract: &str) -> Result<MarketSignals, SignalError> {
        Ok(self.signals)
    }
}

/// Gate.io public futures candles and funding rate.
#[derive(Debug, Clone)]
pub struct GateSignalService {
    http: reqwest::Client,
    base_url: String,
    trend_window: usize,
    rsi_period: usize,
    fallback_funding_rate: f64,
}

#[derive(Debug, Deserialize)]
struct GateCandle {
    t: i64,
    o: String,
    h: String,
    l: String,
    c: String,
}

#[derive(Debug, Deserialize)]
struct GateContractFunding {
    funding_rate: String,
}

impl GateSignalService {
    pub fn from_config(cfg: &SignalsConfig) -> Result<Self, SignalError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms()))
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.rest_url.trim_end_matches('/').to_string(),
            trend_window: cfg.trend_window(),
            rsi_period: cfg.rsi_period(),
            fallback_funding_rate: cfg.fallback_funding_rate,
        })
    }

    async fn fetch_candles(
        &self,
        contract: &str,
        interval: &'static str,
        limit: usize,
    ) -> Result<Vec<Candle>, SignalError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_candles_once(contract, interval, limit).await {
                Ok(candles) => return Ok(candles),
                Err(error) if attempt < FETCH_ATTEMPTS => {
                    warn!(interval, attempt, error = %error, "candle fetch failed; retrying");
                    tokio::time::sleep(FETCH_RETRY_PAUSE).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn fetch_candles_once(
        &self,
        contract: &str,
        interval: &'static str,
        limit: usize,
    ) -> Result<Vec<Candle>, SignalError> {
        let url = format!("{}/futures/usdt/candlesticks", self.base_url);
        let limit = limit.to_string();
        let response = self
            .http
            .get(url)
            .query(&[("contract", contract), ("interval", interval), ("limit", limit.as_str())])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SignalError::Api {
                status: status.as_u16(),
                body: body.chars().take(256).collect(),
            });
        }
        parse_candles(&body)
    }

    async fn fetch_funding_rate(&self, contract: &str) -> Result<f64, SignalError> {
        let url = format!("{}/futures/usdt/contracts/{contract}", self.base_url);
        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SignalError::Api {
                status: status.as_u16(),
                body: body.chars().take(256).collect(),
            });
        }
        let contract: GateContractFunding = serde_json::from_str(&body)?;
        contract
            .funding_rate
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|rate| rate.is_finite())
            .ok_or(SignalError::InsufficientData {
                interval: "funding",
                got: 0,
            })
    }
}

#[async_trait]
impl SignalService for GateSignalService {
    async fn compute_signals(&self, contract: &str) -> Result<MarketSignals, SignalError> {
        let hourly = self.fetch_candles(contract, "1h", HOURLY_LIMIT).await?;

        let five_minute = match self.fetch_candles(contract, "5m", INTRADAY_LIMIT).await {
            Ok(candles) => candles,
            Err(error) => {
                warn!(error = %error, "5m candles unavailable; trend and rsi stay neutral");
                Vec::new()
            }
        };
        let one_minute = match self.fetch_candles(contract, "1m", INTRADAY_LIMIT).await {
            Ok(candles) => candles,
            Err(error) => {
                warn!(error = %error, "1m candles unavailable; no range tightening");
                Vec::new()
            }
        };
        let funding_rate = match self.fetch_funding_rate(contract).await {
            Ok(rate) => rate,
            Err(error) => {
                warn!(
                    error = %error,
                    fallback = self.fallback_funding_rate,
                    "funding rate unavailable"
                );
                self.fallback_funding_rate
            }
        };

        debug!(
            hourly = hourly.len(),
            five_minute = five_minute.len(),
            one_minute = one_minute.len(),
            "candles fetched"
        );
        compute_from_candles(
            &hourly,
            &five_minute,
            &one_minute,
            funding_rate,
            self.trend_window,
            self.rsi_period,
        )
    }
}

pub fn build_signal_service(cfg: &SignalsConfig) -> Result<Box<dyn SignalService>, SignalError> {
    match cfg.source.trim().to_ascii_lowercase().as_str() {
        "static" => Ok(Box::new(StaticSignalService::default())),
        "gateio" => Ok(Box::new(GateSignalService::from_config(cfg)?)),
        _ => Err(SignalError::InvalidSource(cfg.source.clone())),
    }
}

fn parse_candles(body: &str) -> Result<Vec<Candle>, SignalError> {
    let rows: Vec<GateCandle> = serde_json::from_str(body)?;
    let mut candles: Vec<Candle> = rows
        .into_iter()
        .filter_map(|row| {
            Some(Candle {
                ts_s: row.t,
                open: row.o.trim().parse().ok()?,
                high: row.h.trim().parse().ok()?,
                low: row.l.trim().parse().ok()?,
                close: row.c.trim().parse().ok()?,
            })
        })
        .collect();
    candles.sort_by_key(|candle| candle.ts_s);
    Ok(candles)
}
