//! Per-side order lifecycle. Each mindset owns one hedge leg and, every cycle,
//! runs stop-loss, then entry refresh, then take-profit refresh, in that order.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::LadderConfig;
use crate::execution::{Gateway, GatewayError, OrderPurpose, OrderRequest, PositionSide, SidePosition};
use crate::pricing::Quote;
use crate::risk::{RiskDecision, RiskManager};

/// Everything one mindset reads during a cycle. Built fresh per cycle.
#[derive(Debug, Clone)]
pub struct MindsetContext {
    pub position_side: PositionSide,
    pub price: f64,
    pub quote: Quote,
    pub position: SidePosition,
    pub ladder: LadderConfig,
    pub order_qty: f64,
    pub risk: RiskManager,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MindsetOutcome {
    pub stop_loss: bool,
    pub entries_canceled: usize,
    pub entries_placed: usize,
    pub take_profits_canceled: usize,
    pub take_profit_placed: bool,
    pub failures: usize,
}

/// Never fires for a position whose entry price is unknown (zero).
pub fn stop_loss_triggered(
    position_side: PositionSide,
    position: &SidePosition,
    price: f64,
    sl_spread: f64,
) -> bool {
    if !position.is_open() || !position.has_entry_price() {
        return false;
    }
    match position_side {
        PositionSide::Long => price < position.entry_price * (1.0 - sl_spread),
        PositionSide::Short => price > position.entry_price * (1.0 + sl_spread),
    }
}

/// Limit price for the stop close, set through the book so it executes immediately.
pub fn stop_loss_price(position_side: PositionSide, price: f64, aggression: f64) -> f64 {
    match position_side {
        PositionSide::Long => price * (1.0 - aggression),
        PositionSide::Short => price * (1.0 + aggression),
    }
}

/// Maker-safe base price for this side: at least `maker_guard` away from the
/// current price, at most `max_entry_spread` away.
pub fn entry_base_price(
    position_side: PositionSide,
    quote: &Quote,
    price: f64,
    ladder: &LadderConfig,
) -> f64 {
    let guard = price * ladder.maker_guard;
    match position_side {
        PositionSide::Long => quote
            .best_bid
            .min(price - guard)
            .max(price * (1.0 - ladder.max_entry_spread)),
        PositionSide::Short => quote
            .best_ask
            .max(price + guard)
            .min(price * (1.0 + ladder.max_entry_spread)),
    }
}

/// Entry ladder, innermost layer first. Non-positive prices are dropped.
pub fn entry_prices(
    position_side: PositionSide,
    quote: &Quote,
    price: f64,
    ladder: &LadderConfig,
) -> Vec<f64> {
    let base = entry_base_price(position_side, quote, price, ladder);
    (0..ladder.order_layers)
        .map(|layer| {
            let offset = layer as f64 * ladder.layer_spread;
            match position_side {
                PositionSide::Long => base * (1.0 - offset),
                PositionSide::Short => base * (1.0 + offset),
            }
        })
        .filter(|p| p.is_finite() && *p > 0.0)
        .collect()
}

/// Take-profit that is both `tp_spread` beyond entry and a maker relative to the current price.
/// `None` when the entry price is unknown.
pub fn take_profit_price(
    position_side: PositionSide,
    position: &SidePosition,
    price: f64,
    ladder: &LadderConfig,
) -> Option<f64> {
    if !position.has_entry_price() {
        return None;
    }
    let tp = match position_side {
        PositionSide::Long => {
            let target = position.entry_price * (1.0 + ladder.tp_spread);
            target.max(price * (1.0 + ladder.tp_maker_buffer))
        }
        PositionSide::Short => {
            let target = position.entry_price * (1.0 - ladder.tp_spread);
            target.min(price * (1.0 - ladder.tp_maker_buffer))
        }
    };
    Some(tp)
}

/// Runs one mindset cycle. Single order rejections are logged and skipped;
/// only a failed listing of this side's orders aborts the cycle for this side.
pub async fn run_mindset(
    gateway: &dyn Gateway,
    ctx: &MindsetContext,
) -> Result<MindsetOutcome, GatewayError> {
    let side = ctx.position_side;
    let mut outcome = MindsetOutcome::default();

    if ctx.position.is_open() && !ctx.position.has_entry_price() {
        warn!(
            position_side = side.as_str(),
            qty = ctx.position.quantity,
            "position has no entry price; skipping stop loss and take profit"
        );
    }

    if stop_loss_triggered(side, &ctx.position, ctx.price, ctx.ladder.sl_spread) {
        let stop_price = stop_loss_price(side, ctx.price, ctx.ladder.stop_aggression);
        warn!(
            position_side = side.as_str(),
            price = ctx.price,
            entry = ctx.position.entry_price,
            sl_spread = ctx.ladder.sl_spread,
            qty = ctx.position.quantity,
            "stop loss triggered"
        );
        outcome.stop_loss = true;
        let request = OrderRequest::close(side, stop_price, ctx.position.quantity);
        if let Err(error) = gateway.place_order(&request).await {
            warn!(position_side = side.as_str(), error = %error, "stop loss order failed");
            outcome.failures += 1;
        }
        return Ok(outcome);
    }

    let (canceled, failed) = cancel_side_orders(gateway, side, OrderPurpose::Entry).await?;
    outcome.entries_canceled = canceled;
    outcome.failures += failed;

    let mut projected = ctx.position;
    for entry_price in entry_prices(side, &ctx.quote, ctx.price, &ctx.ladder) {
        let request = OrderRequest::entry(side, entry_price, ctx.order_qty);
        if let RiskDecision::Reject(reason) = ctx.risk.validate(&request, &projected) {
            debug!(position_side = side.as_str(), price = entry_price, reason = %reason, "entry blocked by risk");
            continue;
        }
        match gateway.place_order(&request).await {
            Ok(order_id) => {
                outcome.entries_placed += 1;
                projected.quantity += request.qty;
                debug!(position_side = side.as_str(), order_id = %order_id, price = entry_price, "entry placed");
            }
            Err(error) => {
                outcome.failures += 1;
                warn!(position_side = side.as_str(), price = entry_price, error = %error, "entry order failed");
            }
        }
    }

    let (canceled, failed) = cancel_side_orders(gateway, side, OrderPurpose::Close).await?;
    outcome.take_profits_canceled = canceled;
    outcome.failures += failed;

    let tp_price = ctx
        .position
        .is_open()
        .then(|| take_profit_price(side, &ctx.position, ctx.price, &ctx.ladder))
        .flatten();
    if let Some(tp_price) = tp_price {
        let request = OrderRequest::close(side, tp_price, ctx.position.quantity);
        match gateway.place_order(&request).await {
            Ok(order_id) => {
                outcome.take_profit_placed = true;
                debug!(position_side = side.as_str(), order_id = %order_id, price = tp_price, "take profit placed");
            }
            Err(error) => {
                outcome.failures += 1;
                warn!(position_side = side.as_str(), price = tp_price, error = %error, "take profit order failed");
            }
        }
    }

    if outcome.failures > 0 {
        info!(position_side = side.as_str(), failures = outcome.failures, "mindset cycle finished with failures");
    }
    Ok(outcome)
}

async fn cancel_side_orders(
    gateway: &dyn Gateway,
    position_side: PositionSide,
    purpose: OrderPurpose,
) -> Result<(usize, usize), GatewayError> {
    let orders = gateway.fetch_side_orders(position_side, purpose).await?;
    let mut canceled = 0;
    let mut failed = 0;
    for order in &orders {
        match gateway.cancel_order(&order.id).await {
            Ok(()) => canceled += 1,
            Err(error) => {
                failed += 1;
                warn!(order_id = %order.id, position_side = position_side.as_str(), error = %error, "cancel failed");
            }
        }
    }
    Ok((canceled, failed))
}
