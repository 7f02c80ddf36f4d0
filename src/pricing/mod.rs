use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::config::PricingConfig;
use crate::signals::MarketSignals;

/// Inputs to one quote computation. `gamma` comes from the bandit; the rest
/// from the latest signal refresh and stay in place until the next one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskParameters {
    pub gamma: f64,
    pub eta: f64,
    pub sigma: f64,
    pub t_end: f64,
    pub trend_alpha: f64,
    pub funding_rate: f64,
    pub rsi: f64,
    pub high_1m: f64,
    pub low_1m: f64,
}

impl RiskParameters {
    pub fn from_signals(gamma: f64, t_end: f64, signals: &MarketSignals) -> Self {
        Self {
            gamma,
            eta: signals.eta,
            sigma: signals.sigma,
            t_end,
            trend_alpha: signals.trend_alpha,
            funding_rate: signals.funding_rate,
            rsi: signals.rsi,
            high_1m: signals.high_1m,
            low_1m: signals.low_1m,
        }
    }

    pub fn apply_signals(&mut self, signals: &MarketSignals) {
        *self = Self::from_signals(self.gamma, self.t_end, signals);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quote {
    pub reservation_price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub half_spread: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum PricingError {
    #[error("gamma must be > 0, got {0}")]
    NonPositiveGamma(f64),
    #[error("non-finite {0}")]
    NonFinite(&'static str),
}

/// Turns a price, inventory and risk parameters into a two-sided quote.
pub trait PricingEngine: Send + Sync {
    fn quote(
        &self,
        price: f64,
        inventory: f64,
        params: &RiskParameters,
        max_entry_spread: f64,
    ) -> Quote;
}

/// Avellaneda-Stoikov reservation price with funding, RSI and trend biases.
#[derive(Debug, Clone)]
pub struct AvellanedaStoikov {
    cfg: PricingConfig,
    order_qty: f64,
}

impl AvellanedaStoikov {
    pub fn new(cfg: PricingConfig, order_qty: f64) -> Self {
        Self { cfg, order_qty }
    }

    /// Target inventory implied by the funding rate: short when longs pay, long when shorts pay.
    pub fn funding_bias(&self, funding_rate: f64) -> f64 {
        let size = self.order_qty * self.cfg.funding_bias_multiple;
        if funding_rate > self.cfg.funding_threshold {
            -size
        } else if funding_rate < -self.cfg.funding_threshold {
            size
        } else {
            0.0
        }
    }

    pub fn rsi_bias(&self, price: f64, rsi: f64) -> f64 {
        let shift = price * self.cfg.rsi_shift_fraction;
        if rsi > self.cfg.rsi_overbought {
            -shift
        } else if rsi < self.cfg.rsi_oversold {
            shift
        } else {
            0.0
        }
    }

    pub fn reservation_price(&self, price: f64, inventory: f64, params: &RiskParameters) -> f64 {
        let effective_inventory = inventory - self.funding_bias(params.funding_rate);
        let inv_term = effective_inventory * params.gamma * params.sigma.powi(2) * params.t_end;
        let trend = self.cfg.trend_multiplier * params.trend_alpha;
        price + trend + self.rsi_bias(price, params.rsi) - inv_term
    }

    /// Half-spread in price units after range tightening and safety clamps.
    pub fn half_spread(
        &self,
        price: f64,
        params: &RiskParameters,
        max_entry_spread: f64,
    ) -> Result<f64, PricingError> {
        if !(params.gamma > 0.0) {
            return Err(PricingError::NonPositiveGamma(params.gamma));
        }
        if !price.is_finite() || !params.sigma.is_finite() || !params.eta.is_finite() {
            return Err(PricingError::NonFinite("pricing input"));
        }

        let gamma = params.gamma;
        let eta = params.eta.max(self.cfg.eta_floor);
        let inventory_risk = 0.5 * gamma * params.sigma.powi(2) * params.t_end;
        let liquidity = (1.0 / gamma) * (1.0 + gamma / eta).ln();
        let delta_pct = inventory_risk + liquidity;
        if !delta_pct.is_finite() {
            return Err(PricingError::NonFinite("delta"));
        }

        let mut delta = delta_pct * price;
        if params.high_1m > 0.0 && params.low_1m > 0.0 && params.high_1m > params.low_1m {
            delta = delta.min((params.high_1m - params.low_1m) * 0.5);
        }
        delta = delta.min(price * max_entry_spread);
        Ok(delta.max(price * self.cfg.min_tick_fraction))
    }
}

impl PricingEngine for AvellanedaStoikov {
    fn quote(
        &self,
        price: f64,
        inventory: f64,
        params: &RiskParameters,
        max_entry_spread: f64,
    ) -> Quote {
        let floor = self.cfg.price_floor;
        let mut reservation = self.reservation_price(price, inventory, params);
        if !reservation.is_finite() {
            warn!(price, inventory, "reservation price undefined; quoting around price");
            reservation = price;
        }
        let reservation = reservation.max(floor);

        let half_spread = match self.half_spread(price, params, max_entry_spread) {
            Ok(delta) => delta,
            Err(error) => {
                let fallback = self.cfg.grid_spacing * price * 0.5;
                warn!(error = %error, fallback, "half spread undefined; using grid fallback");
                fallback
            }
        };

        Quote {
            reservation_price: reservation,
            best_bid: (reservation - half_spread).max(floor),
            best_ask: (reservation + half_spread).max(floor),
            half_spread,
        }
    }
}
