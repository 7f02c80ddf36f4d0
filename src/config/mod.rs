use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub marketdata: MarketDataConfig,
    #[serde(default)]
    pub signals: SignalsConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub ladder: LadderConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Base coin, e.g. `XRP`; the contract traded is `{symbol}_USDT`.
    pub symbol: String,
    #[serde(default = "default_order_qty")]
    pub order_qty: f64,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_report_interval_s")]
    pub report_interval_s: u64,
    /// Default tracing directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl GeneralConfig {
    pub fn contract(&self) -> String {
        format!("{}_USDT", self.symbol.trim().to_uppercase())
    }

    pub fn report_interval_s(&self) -> u64 {
        self.report_interval_s.max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataConfig {
    #[serde(default = "default_marketdata_mode", alias = "source")]
    pub mode: String,
    #[serde(default = "default_marketdata_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_mock_start_price")]
    pub mock_start_price: f64,
    #[serde(default = "default_gate_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_gate_ws_testnet_url")]
    pub ws_testnet_url: String,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_reconnect_backoff_max_ms")]
    pub reconnect_backoff_max_ms: u64,
    #[serde(default = "default_ping_interval_s")]
    pub ping_interval_s: u64,
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            mode: default_marketdata_mode(),
            interval_ms: default_marketdata_interval_ms(),
            mock_start_price: default_mock_start_price(),
            ws_url: default_gate_ws_url(),
            ws_testnet_url: default_gate_ws_testnet_url(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            reconnect_backoff_max_ms: default_reconnect_backoff_max_ms(),
            ping_interval_s: default_ping_interval_s(),
            channel_buffer: default_channel_buffer(),
        }
    }
}

impl MarketDataConfig {
    pub fn channel_buffer(&self) -> usize {
        self.channel_buffer.max(1)
    }

    pub fn reconnect_backoff_ms(&self) -> u64 {
        self.reconnect_backoff_ms.max(1)
    }

    pub fn reconnect_backoff_max_ms(&self) -> u64 {
        self.reconnect_backoff_max_ms.max(self.reconnect_backoff_ms())
    }

    pub fn ping_interval_s(&self) -> u64 {
        self.ping_interval_s.max(1)
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms.max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalsConfig {
    #[serde(default = "default_signals_source")]
    pub source: String,
    #[serde(default = "default_gate_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_signals_refresh_interval_s")]
    pub refresh_interval_s: u64,
    #[serde(default = "default_signals_failure_backoff_s")]
    pub failure_backoff_s: u64,
    #[serde(default = "default_signals_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    /// Funding rate used when the funding endpoint cannot be read.
    #[serde(default = "default_fallback_funding_rate")]
    pub fallback_funding_rate: f64,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            source: default_signals_source(),
            rest_url: default_gate_rest_url(),
            refresh_interval_s: default_signals_refresh_interval_s(),
            failure_backoff_s: default_signals_failure_backoff_s(),
            timeout_ms: default_signals_timeout_ms(),
            trend_window: default_trend_window(),
            rsi_period: default_rsi_period(),
            fallback_funding_rate: default_fallback_funding_rate(),
        }
    }
}

impl SignalsConfig {
    pub fn refresh_interval_s(&self) -> u64 {
        self.refresh_interval_s.max(1)
    }

    pub fn failure_backoff_s(&self) -> u64 {
        self.failure_backoff_s.max(1)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.max(100)
    }

    pub fn trend_window(&self) -> usize {
        self.trend_window.max(1)
    }

    pub fn rsi_period(&self) -> usize {
        self.rsi_period.max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    /// Initial risk aversion; replaced by the bandit once it selects an arm.
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_t_end")]
    pub t_end: f64,
    #[serde(default = "default_funding_threshold")]
    pub funding_threshold: f64,
    /// Target inventory shift, in multiples of the base order size.
    #[serde(default = "default_funding_bias_multiple")]
    pub funding_bias_multiple: f64,
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,
    #[serde(default = "default_rsi_shift_fraction")]
    pub rsi_shift_fraction: f64,
    #[serde(default = "default_trend_multiplier")]
    pub trend_multiplier: f64,
    #[serde(default = "default_eta_floor")]
    pub eta_floor: f64,
    #[serde(default = "default_min_tick_fraction")]
    pub min_tick_fraction: f64,
    #[serde(default = "default_price_floor")]
    pub price_floor: f64,
    /// Base grid spacing; half of it is the fallback half-spread fraction.
    #[serde(default = "default_grid_spacing")]
    pub grid_spacing: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            gamma: default_gamma(),
            t_end: default_t_end(),
            funding_threshold: default_funding_threshold(),
            funding_bias_multiple: default_funding_bias_multiple(),
            rsi_overbought: default_rsi_overbought(),
            rsi_oversold: default_rsi_oversold(),
            rsi_shift_fraction: default_rsi_shift_fraction(),
            trend_multiplier: default_trend_multiplier(),
            eta_floor: default_eta_floor(),
            min_tick_fraction: default_min_tick_fraction(),
            price_floor: default_price_floor(),
            grid_spacing: default_grid_spacing(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LadderConfig {
    #[serde(default = "default_order_layers")]
    pub order_layers: usize,
    #[serde(default = "default_layer_spread")]
    pub layer_spread: f64,
    #[serde(default = "default_tp_spread")]
    pub tp_spread: f64,
    /// Initial stop-loss width; the dynamic risk controller overrides it.
    #[serde(default = "default_sl_spread")]
    pub sl_spread: f64,
    #[serde(default = "default_max_entry_spread")]
    pub max_entry_spread: f64,
    #[serde(default = "default_maker_guard")]
    pub maker_guard: f64,
    #[serde(default = "default_tp_maker_buffer")]
    pub tp_maker_buffer: f64,
    #[serde(default = "default_stop_aggression")]
    pub stop_aggression: f64,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            order_layers: default_order_layers(),
            layer_spread: default_layer_spread(),
            tp_spread: default_tp_spread(),
            sl_spread: default_sl_spread(),
            max_entry_spread: default_max_entry_spread(),
            maker_guard: default_maker_guard(),
            tp_maker_buffer: default_tp_maker_buffer(),
            stop_aggression: default_stop_aggression(),
        }
    }
}

impl LadderConfig {
    pub fn with_sl_spread(&self, sl_spread: f64) -> Self {
        Self {
            sl_spread,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_sl_min")]
    pub sl_min: f64,
    #[serde(default = "default_sl_max")]
    pub sl_max: f64,
    #[serde(default = "default_sl_sigma_multiplier")]
    pub sl_sigma_multiplier: f64,
    #[serde(default = "default_volatility_threshold")]
    pub volatility_threshold: f64,
    #[serde(default = "default_fast_refresh_s")]
    pub fast_refresh_s: u64,
    #[serde(default = "default_slow_refresh_s")]
    pub slow_refresh_s: u64,
    #[serde(default = "default_max_position")]
    pub max_position: f64,
    #[serde(default = "default_max_order_qty")]
    pub max_order_qty: f64,
    #[serde(default = "default_max_notional")]
    pub max_notional: f64,
    /// Minimum spacing between position/order polls against the gateway.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            sl_min: default_sl_min(),
            sl_max: default_sl_max(),
            sl_sigma_multiplier: default_sl_sigma_multiplier(),
            volatility_threshold: default_volatility_threshold(),
            fast_refresh_s: default_fast_refresh_s(),
            slow_refresh_s: default_slow_refresh_s(),
            max_position: default_max_position(),
            max_order_qty: default_max_order_qty(),
            max_notional: default_max_notional(),
            sync_interval_ms: default_sync_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BanditConfig {
    #[serde(default = "default_bandit_arms")]
    pub arms: Vec<f64>,
    #[serde(default = "default_exploration")]
    pub exploration: f64,
    #[serde(default = "default_epoch_s")]
    pub epoch_s: u64,
    #[serde(default = "default_warmup_s")]
    pub warmup_s: u64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            arms: default_bandit_arms(),
            exploration: default_exploration(),
            epoch_s: default_epoch_s(),
            warmup_s: default_warmup_s(),
        }
    }
}

impl BanditConfig {
    pub fn epoch_s(&self) -> u64 {
        self.epoch_s.max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_execution_testnet")]
    pub testnet: bool,
    /// `paper` or `gateio`.
    #[serde(default = "default_execution_venue")]
    pub venue: String,
    #[serde(default = "default_gate_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_gate_rest_testnet_url")]
    pub rest_testnet_url: String,
    #[serde(default = "default_execution_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_execution_rate_limit_per_s")]
    pub rate_limit_per_s: u32,
    #[serde(default = "default_paper_balance")]
    pub paper_balance: f64,
    /// Fee charged on paper fills as a fraction of notional.
    #[serde(default = "default_paper_fee_rate")]
    pub paper_fee_rate: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            testnet: default_execution_testnet(),
            venue: default_execution_venue(),
            rest_url: default_gate_rest_url(),
            rest_testnet_url: default_gate_rest_testnet_url(),
            timeout_ms: default_execution_timeout_ms(),
            rate_limit_per_s: default_execution_rate_limit_per_s(),
            paper_balance: default_paper_balance(),
            paper_fee_rate: default_paper_fee_rate(),
        }
    }
}

impl ExecutionConfig {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.max(100)
    }

    pub fn rate_limit_per_s(&self) -> u32 {
        self.rate_limit_per_s.max(1)
    }

    pub fn rest_base_url(&self) -> &str {
        if self.testnet {
            self.rest_testnet_url.trim_end_matches('/')
        } else {
            self.rest_url.trim_end_matches('/')
        }
    }

    pub fn is_paper(&self) -> bool {
        self.venue.trim().eq_ignore_ascii_case("paper")
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl AppConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ladder = &self.ladder;
        if self.general.symbol.trim().is_empty() {
            return Err(invalid("general.symbol must not be empty"));
        }
        if !(self.general.order_qty > 0.0) {
            return Err(invalid("general.order_qty must be > 0"));
        }
        if ladder.order_layers == 0 {
            return Err(invalid("ladder.order_layers must be >= 1"));
        }
        if !(ladder.layer_spread > 0.0) {
            return Err(invalid("ladder.layer_spread must be > 0"));
        }
        if !(ladder.tp_spread < ladder.max_entry_spread && ladder.max_entry_spread < ladder.sl_spread)
        {
            return Err(invalid(format!(
                "ladder spreads must satisfy tp_spread ({}) < max_entry_spread ({}) < sl_spread ({})",
                ladder.tp_spread, ladder.max_entry_spread, ladder.sl_spread
            )));
        }
        if self.pricing.min_tick_fraction > ladder.max_entry_spread {
            return Err(invalid(format!(
                "pricing.min_tick_fraction ({}) exceeds ladder.max_entry_spread ({})",
                self.pricing.min_tick_fraction, ladder.max_entry_spread
            )));
        }
        if !(self.pricing.price_floor > 0.0) {
            return Err(invalid("pricing.price_floor must be > 0"));
        }
        if !(self.risk.sl_min > 0.0 && self.risk.sl_min <= self.risk.sl_max) {
            return Err(invalid(format!(
                "risk stop-loss bounds must satisfy 0 < sl_min ({}) <= sl_max ({})",
                self.risk.sl_min, self.risk.sl_max
            )));
        }
        // The dynamic stop never goes below sl_min, so it must stay outside the entry band.
        if !(ladder.max_entry_spread < self.risk.sl_min) {
            return Err(invalid(format!(
                "risk.sl_min ({}) must exceed ladder.max_entry_spread ({})",
                self.risk.sl_min, ladder.max_entry_spread
            )));
        }
        if !(self.execution.paper_fee_rate >= 0.0 && self.execution.paper_fee_rate < 1.0) {
            return Err(invalid("execution.paper_fee_rate must be in [0, 1)"));
        }
        if self.bandit.arms.is_empty() {
            return Err(invalid("bandit.arms must not be empty"));
        }
        if self
            .bandit
            .arms
            .iter()
            .any(|arm| !arm.is_finite() || *arm <= 0.0)
        {
            return Err(invalid("bandit.arms must all be finite and > 0"));
        }
        if !(self.bandit.exploration >= 0.0) {
            return Err(invalid("bandit.exploration must be >= 0"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn default_order_qty() -> f64 {
    1.0
}

fn default_leverage() -> u32 {
    20
}

fn default_report_interval_s() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_marketdata_mode() -> String {
    "mock".to_string()
}

fn default_marketdata_interval_ms() -> u64 {
    500
}

fn default_mock_start_price() -> f64 {
    100.0
}

fn default_gate_ws_url() -> String {
    "wss://fx-ws.gateio.ws/v4/ws/usdt".to_string()
}

fn default_gate_ws_testnet_url() -> String {
    "wss://fx-ws-testnet.gateio.ws/v4/ws/usdt".to_string()
}

fn default_reconnect_backoff_ms() -> u64 {
    500
}

fn default_reconnect_backoff_max_ms() -> u64 {
    30_000
}

fn default_ping_interval_s() -> u64 {
    20
}

fn default_channel_buffer() -> usize {
    4_096
}

fn default_signals_source() -> String {
    "static".to_string()
}

fn default_gate_rest_url() -> String {
    "https://api.gateio.ws/api/v4".to_string()
}

fn default_gate_rest_testnet_url() -> String {
    "https://fx-api-testnet.gateio.ws/api/v4".to_string()
}

fn default_signals_refresh_interval_s() -> u64 {
    300
}

fn default_signals_failure_backoff_s() -> u64 {
    60
}

fn default_signals_timeout_ms() -> u64 {
    5_000
}

fn default_trend_window() -> usize {
    6
}

fn default_rsi_period() -> usize {
    14
}

fn default_fallback_funding_rate() -> f64 {
    0.0001
}

fn default_gamma() -> f64 {
    0.5
}

fn default_t_end() -> f64 {
    0.02
}

fn default_funding_threshold() -> f64 {
    0.00005
}

fn default_funding_bias_multiple() -> f64 {
    5.0
}

fn default_rsi_overbought() -> f64 {
    70.0
}

fn default_rsi_oversold() -> f64 {
    30.0
}

fn default_rsi_shift_fraction() -> f64 {
    0.002
}

fn default_trend_multiplier() -> f64 {
    2.0
}

fn default_eta_floor() -> f64 {
    0.001
}

fn default_min_tick_fraction() -> f64 {
    0.0001
}

fn default_price_floor() -> f64 {
    0.001
}

fn default_grid_spacing() -> f64 {
    0.0006
}

fn default_order_layers() -> usize {
    1
}

fn default_layer_spread() -> f64 {
    0.0005
}

fn default_tp_spread() -> f64 {
    0.0002
}

fn default_sl_spread() -> f64 {
    0.002
}

fn default_max_entry_spread() -> f64 {
    0.0005
}

fn default_maker_guard() -> f64 {
    0.0001
}

fn default_tp_maker_buffer() -> f64 {
    0.0005
}

fn default_stop_aggression() -> f64 {
    0.01
}

fn default_sl_min() -> f64 {
    0.002
}

fn default_sl_max() -> f64 {
    0.01
}

fn default_sl_sigma_multiplier() -> f64 {
    0.5
}

fn default_volatility_threshold() -> f64 {
    0.01
}

fn default_fast_refresh_s() -> u64 {
    10
}

fn default_slow_refresh_s() -> u64 {
    30
}

fn default_max_position() -> f64 {
    100.0
}

fn default_max_order_qty() -> f64 {
    50.0
}

fn default_max_notional() -> f64 {
    10_000.0
}

fn default_sync_interval_ms() -> u64 {
    1_000
}

fn default_bandit_arms() -> Vec<f64> {
    vec![0.1, 0.3, 0.5, 0.7, 0.9]
}

fn default_exploration() -> f64 {
    std::f64::consts::SQRT_2
}

fn default_epoch_s() -> u64 {
    300
}

fn default_warmup_s() -> u64 {
    10
}

fn default_execution_testnet() -> bool {
    true
}

fn default_execution_venue() -> String {
    "paper".to_string()
}

fn default_execution_timeout_ms() -> u64 {
    5_000
}

fn default_execution_rate_limit_per_s() -> u32 {
    8
}

fn default_paper_balance() -> f64 {
    1_000.0
}

fn default_paper_fee_rate() -> f64 {
    0.0002
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, ConfigError};

    fn parse(raw: &str) -> AppConfig {
        toml::from_str(raw).expect("config should parse")
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse(
            r#"
            [general]
            symbol = "xrp"
            "#,
        );

        assert_eq!(cfg.general.contract(), "XRP_USDT");
        assert_eq!(cfg.ladder.order_layers, 1);
        assert_eq!(cfg.bandit.arms, vec![0.1, 0.3, 0.5, 0.7, 0.9]);
        assert!(cfg.execution.is_paper());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_take_profit_wider_than_entry_band() {
        let cfg = parse(
            r#"
            [general]
            symbol = "XRP"

            [ladder]
            tp_spread = 0.001
            max_entry_spread = 0.0005
            sl_spread = 0.002
            "#,
        );

        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_stop_floor_inside_entry_band() {
        let cfg = parse(
            r#"
            [general]
            symbol = "XRP"

            [risk]
            sl_min = 0.0003
            "#,
        );

        match cfg.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("risk.sl_min")),
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_bandit_arms() {
        let cfg = parse(
            r#"
            [general]
            symbol = "XRP"

            [bandit]
            arms = []
            "#,
        );

        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn testnet_selects_testnet_rest_url() {
        let cfg = parse(
            r#"
            [general]
            symbol = "XRP"

            [execution]
            testnet = true
            venue = "gateio"
            rest_testnet_url = "https://example.test/api/v4/"
            "#,
        );

        assert_eq!(cfg.execution.rest_base_url(), "https://example.test/api/v4");
        assert!(!cfg.execution.is_paper());
    }

    #[test]
    fn shipped_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml");
        let cfg = AppConfig::load_from_path(path).expect("default config is valid");
        assert_eq!(cfg.general.contract(), "XRP_USDT");
        assert_eq!(cfg.general.log_level, "info");
        assert_eq!(cfg.marketdata.mode, "mock");
    }
}
