use std::time::Duration;

use serde::Serialize;

use crate::config::RiskConfig;
use crate::execution::{OrderRequest, SidePosition};

/// Volatility-dependent stop width and re-quote cadence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskSettings {
    pub sl_spread: f64,
    pub refresh_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct DynamicRiskController {
    sl_min: f64,
    sl_max: f64,
    sigma_multiplier: f64,
    volatility_threshold: f64,
    fast_refresh: Duration,
    slow_refresh: Duration,
}

impl DynamicRiskController {
    pub fn new(cfg: &RiskConfig) -> Self {
        Self {
            sl_min: cfg.sl_min,
            sl_max: cfg.sl_max.max(cfg.sl_min),
            sigma_multiplier: cfg.sl_sigma_multiplier,
            volatility_threshold: cfg.volatility_threshold,
            fast_refresh: Duration::from_secs(cfg.fast_refresh_s.max(1)),
            slow_refresh: Duration::from_secs(cfg.slow_refresh_s.max(1)),
        }
    }

    pub fn evaluate(&self, sigma: f64) -> RiskSettings {
        let target = if sigma.is_finite() {
            sigma * self.sigma_multiplier
        } else {
            self.sl_max
        };
        let refresh_interval = if sigma > self.volatility_threshold {
            self.fast_refresh
        } else {
            self.slow_refresh
        };

        RiskSettings {
            sl_spread: target.clamp(self.sl_min, self.sl_max),
            refresh_interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskManager {
    max_position: f64,
    max_order_qty: f64,
    max_notional: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Allow,
    Reject(String),
}

impl RiskManager {
    pub fn new(max_position: f64, max_order_qty: f64, max_notional: f64) -> Self {
        Self {
            max_position,
            max_order_qty,
            max_notional,
        }
    }

    pub fn from_config(cfg: &RiskConfig) -> Self {
        Self::new(cfg.max_position, cfg.max_order_qty, cfg.max_notional)
    }

    /// Pre-trade check for one order against the leg it works on. Reduce-only
    /// closes always pass so a stop or take-profit is never blocked.
    pub fn validate(&self, request: &OrderRequest, current: &SidePosition) -> RiskDecision {
        if request.reduce_only {
            return RiskDecision::Allow;
        }

        let qty = request.qty;
        if qty <= 0.0 {
            return RiskDecision::Reject("qty must be > 0".to_string());
        }

        if qty > self.max_order_qty {
            return RiskDecision::Reject(format!(
                "qty {} exceeds max_order_qty {}",
                qty, self.max_order_qty
            ));
        }

        let notional = qty * request.price;
        if notional > self.max_notional {
            return RiskDecision::Reject(format!(
                "notional {} exceeds max_notional {}",
                notional, self.max_notional
            ));
        }

        let projected_position = current.quantity + qty;
        if projected_position > self.max_position {
            return RiskDecision::Reject(format!(
                "projected {} position {} exceeds max_position {}",
                request.position_side.as_str(),
                projected_position,
                self.max_position
            ));
        }

        RiskDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{DynamicRiskController, RiskDecision, RiskManager};
    use crate::config::RiskConfig;
    use crate::execution::{OrderRequest, PositionSide, SidePosition};

    #[test]
    fn blocks_qty_over_limit() {
        let risk = RiskManager::new(10.0, 1.0, 1_000.0);
        let decision = risk.validate(
            &OrderRequest::entry(PositionSide::Long, 100.0, 2.0),
            &SidePosition::default(),
        );
        assert!(matches!(decision, RiskDecision::Reject(_)));
    }

    #[test]
    fn blocks_entries_past_side_limit_but_never_closes() {
        let risk = RiskManager::new(5.0, 10.0, 10_000.0);
        let held = SidePosition::new(4.5, 100.0);

        let entry = risk.validate(&OrderRequest::entry(PositionSide::Short, 100.0, 1.0), &held);
        assert!(matches!(entry, RiskDecision::Reject(_)));

        let close = risk.validate(&OrderRequest::close(PositionSide::Short, 100.0, 40.0), &held);
        assert_eq!(close, RiskDecision::Allow);
    }

    #[test]
    fn stop_width_is_clamped_and_monotone() {
        let controller = DynamicRiskController::new(&RiskConfig::default());
        let mut previous = 0.0;
        for sigma in [0.0, 0.001, 0.004, 0.008, 0.012, 0.02, 0.05, 1.0] {
            let settings = controller.evaluate(sigma);
            assert!(settings.sl_spread >= 0.002);
            assert!(settings.sl_spread <= 0.01);
            assert!(settings.sl_spread >= previous);
            previous = settings.sl_spread;
        }
        assert!((controller.evaluate(0.012).sl_spread - 0.006).abs() < 1e-12);
    }

    #[test]
    fn cadence_speeds_up_above_volatility_threshold() {
        let controller = DynamicRiskController::new(&RiskConfig::default());
        assert_eq!(controller.evaluate(0.02).refresh_interval, Duration::from_secs(10));
        assert_eq!(controller.evaluate(0.01).refresh_interval, Duration::from_secs(30));
        assert_eq!(controller.evaluate(0.001).refresh_interval, Duration::from_secs(30));
    }
}
