use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::bandit::{BanditError, UcbBandit};
use crate::config::{AppConfig, LadderConfig};
use crate::execution::{
    clear_resting_orders, Gateway, GatewayError, OrderPurpose, OrderResiduals, PositionSide,
    Positions, SidePosition,
};
use crate::ladder::{run_mindset, MindsetContext, MindsetOutcome};
use crate::marketdata::FeedEvent;
use crate::pricing::{PricingEngine, Quote, RiskParameters};
use crate::risk::{DynamicRiskController, RiskManager, RiskSettings};
use crate::signals::{MarketSignals, SignalService};

const SETTLE_CURRENCY: &str = "USDT";
const CONTROL_BUFFER: usize = 16;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("position bootstrap failed: {0}")]
    Bootstrap(#[source] GatewayError),
    #[error(transparent)]
    Bandit(#[from] BanditError),
}

/// Result of a background signal refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalUpdate {
    Refreshed(MarketSignals),
    Failed(String),
}

/// Snapshot handed to one cycle task.
#[derive(Debug, Clone)]
pub struct CycleInput {
    pub price: f64,
    pub positions: Positions,
    pub params: RiskParameters,
    pub ladder: LadderConfig,
    pub order_qty: f64,
    pub risk: RiskManager,
    pub sync: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub price: f64,
    pub quote: Quote,
    pub synced_positions: Option<Positions>,
    pub synced_residuals: Option<OrderResiduals>,
    pub long: Option<MindsetOutcome>,
    pub short: Option<MindsetOutcome>,
}

impl CycleReport {
    pub fn stop_losses(&self) -> u64 {
        [&self.long, &self.short]
            .into_iter()
            .flatten()
            .filter(|outcome| outcome.stop_loss)
            .count() as u64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub cycles: u64,
    pub dropped_ticks: u64,
    pub stop_losses: u64,
    pub epochs: u64,
    pub trades: u64,
    pub fees_paid: f64,
}

/// Counts streamed account updates. A cycle's poll is applied only to state
/// that has not been streamed since the cycle started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StreamRevisions {
    long: u64,
    short: u64,
    orders: u64,
}

impl StreamRevisions {
    fn position(&self, position_side: PositionSide) -> u64 {
        match position_side {
            PositionSide::Long => self.long,
            PositionSide::Short => self.short,
        }
    }

    fn bump_position(&mut self, position_side: PositionSide) {
        match position_side {
            PositionSide::Long => self.long += 1,
            PositionSide::Short => self.short += 1,
        }
    }
}

/// One full strategy cycle: optional reconciliation, quote, then both mindsets
/// concurrently. A failing mindset is logged and does not affect the other.
pub async fn run_cycle(
    gateway: Arc<dyn Gateway>,
    pricing: Arc<dyn PricingEngine>,
    input: CycleInput,
) -> CycleReport {
    let mut positions = input.positions;
    let mut synced_positions = None;
    let mut synced_residuals = None;

    if input.sync {
        match gateway.fetch_positions().await {
            Ok(fetched) => {
                positions = fetched;
                synced_positions = Some(fetched);
            }
            Err(error) => warn!(error = %error, "position sync failed; using streamed state"),
        }
        match gateway.fetch_open_orders().await {
            Ok(orders) => synced_residuals = Some(OrderResiduals::from_open_orders(&orders)),
            Err(error) => warn!(error = %error, "open order sync failed"),
        }
    }

    let quote = pricing.quote(
        input.price,
        positions.inventory(),
        &input.params,
        input.ladder.max_entry_spread,
    );
    debug!(
        price = input.price,
        inventory = positions.inventory(),
        reservation = quote.reservation_price,
        bid = quote.best_bid,
        ask = quote.best_ask,
        "quote computed"
    );

    let context = |position_side: PositionSide| MindsetContext {
        position_side,
        price: input.price,
        quote,
        position: positions.get(position_side),
        ladder: input.ladder.clone(),
        order_qty: input.order_qty,
        risk: input.risk.clone(),
    };
    let long_ctx = context(PositionSide::Long);
    let short_ctx = context(PositionSide::Short);

    let (long, short) = tokio::join!(
        run_mindset(gateway.as_ref(), &long_ctx),
        run_mindset(gateway.as_ref(), &short_ctx)
    );

    CycleReport {
        price: input.price,
        quote,
        synced_positions,
        synced_residuals,
        long: log_mindset(PositionSide::Long, long),
        short: log_mindset(PositionSide::Short, short),
    }
}

fn log_mindset(
    position_side: PositionSide,
    result: Result<MindsetOutcome, GatewayError>,
) -> Option<MindsetOutcome> {
    match result {
        Ok(outcome) => Some(outcome),
        Err(error) => {
            error!(position_side = position_side.as_str(), error = %error, "mindset cycle failed");
            None
        }
    }
}

/// Periodically pulls fresh signals and forwards the outcome to the engine.
pub async fn signal_refresh_loop(
    service: Arc<dyn SignalService>,
    contract: String,
    interval: Duration,
    failure_backoff: Duration,
    updates: mpsc::Sender<SignalUpdate>,
) {
    loop {
        let (update, pause) = match service.compute_signals(&contract).await {
            Ok(signals) => (SignalUpdate::Refreshed(signals), interval),
            Err(error) => (SignalUpdate::Failed(error.to_string()), failure_backoff),
        };
        if updates.send(update).await.is_err() {
            break;
        }
        time::sleep(pause).await;
    }
}

/// Owns all strategy state. Only the run loop mutates it; cycle tasks get copies.
pub struct StrategyEngine {
    contract: String,
    order_qty: f64,
    ladder: LadderConfig,
    gateway: Arc<dyn Gateway>,
    pricing: Arc<dyn PricingEngine>,
    signals: Arc<dyn SignalService>,
    risk_controller: DynamicRiskController,
    risk_manager: RiskManager,
    bandit: UcbBandit,
    params: RiskParameters,
    risk: RiskSettings,
    latest_price: Option<f64>,
    positions: Positions,
    residuals: OrderResiduals,
    revisions: StreamRevisions,
    cycle_revisions: StreamRevisions,
    balance: Option<f64>,
    start_balance: Option<f64>,
    equity_baseline: Option<f64>,
    cycles: JoinSet<CycleReport>,
    last_cycle_at: Option<Instant>,
    last_sync_at: Option<Instant>,
    sync_interval: Duration,
    signal_interval: Duration,
    signal_backoff: Duration,
    epoch: Duration,
    warmup: Duration,
    report_interval: Duration,
    started_at: Instant,
    summary: RunSummary,
}

impl StrategyEngine {
    pub fn new(
        cfg: &AppConfig,
        gateway: Arc<dyn Gateway>,
        pricing: Arc<dyn PricingEngine>,
        signals: Arc<dyn SignalService>,
    ) -> Result<Self, EngineError> {
        let bandit = UcbBandit::new(&cfg.bandit.arms, cfg.bandit.exploration)?;
        let risk_controller = DynamicRiskController::new(&cfg.risk);
        let initial_signals = MarketSignals::default();
        let risk = RiskSettings {
            sl_spread: cfg.ladder.sl_spread,
            ..risk_controller.evaluate(initial_signals.sigma)
        };

        Ok(Self {
            contract: cfg.general.contract(),
            order_qty: cfg.general.order_qty,
            ladder: cfg.ladder.clone(),
            gateway,
            pricing,
            signals,
            risk_controller,
            risk_manager: RiskManager::from_config(&cfg.risk),
            bandit,
            params: RiskParameters::from_signals(cfg.pricing.gamma, cfg.pricing.t_end, &initial_signals),
            risk,
            latest_price: None,
            positions: Positions::default(),
            residuals: OrderResiduals::default(),
            revisions: StreamRevisions::default(),
            cycle_revisions: StreamRevisions::default(),
            balance: None,
            start_balance: None,
            equity_baseline: None,
            cycles: JoinSet::new(),
            last_cycle_at: None,
            last_sync_at: None,
            sync_interval: Duration::from_millis(cfg.risk.sync_interval_ms),
            signal_interval: Duration::from_secs(cfg.signals.refresh_interval_s()),
            signal_backoff: Duration::from_secs(cfg.signals.failure_backoff_s()),
            epoch: Duration::from_secs(cfg.bandit.epoch_s()),
            warmup: Duration::from_secs(cfg.bandit.warmup_s),
            report_interval: Duration::from_secs(cfg.general.report_interval_s()),
            started_at: Instant::now(),
            summary: RunSummary::default(),
        })
    }

    pub fn latest_price(&self) -> Option<f64> {
        self.latest_price
    }

    pub fn positions(&self) -> Positions {
        self.positions
    }

    pub fn residuals(&self) -> &OrderResiduals {
        &self.residuals
    }

    pub fn params(&self) -> RiskParameters {
        self.params
    }

    pub fn risk_settings(&self) -> RiskSettings {
        self.risk
    }

    pub fn bandit(&self) -> &UcbBandit {
        &self.bandit
    }

    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    pub fn cycle_in_flight(&self) -> bool {
        !self.cycles.is_empty()
    }

    /// Cash balance plus unrealized PnL on both legs. Unknown until both a
    /// balance and a price have been seen.
    pub fn equity(&self) -> Option<f64> {
        let price = self.latest_price?;
        let balance = self.balance?;
        Some(balance + self.positions.unrealized_pnl(price))
    }

    /// Clears resting orders, then loads positions, open orders and balance
    /// from the gateway. Only a failed position load is fatal.
    pub async fn startup(&mut self) -> Result<(), EngineError> {
        info!(contract = %self.contract, "startup: cleaning stale orders");
        if let Err(error) = clear_resting_orders(self.gateway.as_ref()).await {
            warn!(error = %error, "could not clear stale orders");
        }

        self.positions = self
            .gateway
            .fetch_positions()
            .await
            .map_err(EngineError::Bootstrap)?;
        self.last_sync_at = Some(Instant::now());

        match self.gateway.fetch_open_orders().await {
            Ok(orders) => self.residuals = OrderResiduals::from_open_orders(&orders),
            Err(error) => warn!(error = %error, "could not load open orders"),
        }
        match self.gateway.fetch_balance().await {
            Ok(balance) => self.set_balance(balance),
            Err(error) => warn!(error = %error, "could not load balance"),
        }

        self.params.gamma = self.bandit.select_arm();
        info!(
            long_qty = self.positions.long.quantity,
            long_entry = self.positions.long.entry_price,
            short_qty = self.positions.short.quantity,
            short_entry = self.positions.short.entry_price,
            balance = ?self.balance,
            gamma = self.params.gamma,
            "startup complete"
        );
        Ok(())
    }

    /// Runs until Ctrl-C or until the feed closes.
    pub async fn run(&mut self, feed: mpsc::Receiver<FeedEvent>) -> RunSummary {
        let shutdown = async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                error!(error = %error, "ctrl-c handler unavailable");
                std::future::pending::<()>().await;
            }
        };
        self.run_until(feed, shutdown).await
    }

    pub async fn run_until<F>(&mut self, mut feed: mpsc::Receiver<FeedEvent>, shutdown: F) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let (control_tx, mut control_rx) = mpsc::channel(CONTROL_BUFFER);
        let refresher: JoinHandle<()> = tokio::spawn(signal_refresh_loop(
            Arc::clone(&self.signals),
            self.contract.clone(),
            self.signal_interval,
            self.signal_backoff,
            control_tx,
        ));

        let now = Instant::now();
        let mut epoch = time::interval_at(now + self.warmup, self.epoch);
        epoch.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut report = time::interval_at(now + self.report_interval, self.report_interval);
        report.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                maybe_event = feed.recv() => {
                    let Some(event) = maybe_event else {
                        warn!("market data feed closed");
                        break;
                    };
                    self.handle_event(event);
                }
                Some(joined) = self.cycles.join_next() => {
                    self.on_cycle_joined(joined);
                }
                Some(update) = control_rx.recv() => {
                    self.apply_signal_update(update);
                }
                _ = epoch.tick() => {
                    self.on_epoch();
                }
                _ = report.tick() => {
                    self.report();
                }
            }
        }

        refresher.abort();
        while let Some(joined) = self.cycles.join_next().await {
            self.on_cycle_joined(joined);
        }
        self.report();
        self.summary
    }

    pub fn handle_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Price { price, .. } => self.on_tick(price),
            FeedEvent::Position {
                side,
                quantity,
                entry_price,
            } => {
                self.positions.set(side, SidePosition::new(quantity, entry_price));
                self.revisions.bump_position(side);
                debug!(position_side = side.as_str(), quantity, entry_price, "position update");
            }
            FeedEvent::Order(update) => {
                self.residuals.apply_update(&update);
                self.revisions.orders += 1;
                debug!(order_id = %update.order_id, remaining = update.remaining, "order update");
            }
            FeedEvent::Trade { size, price, fee } => {
                self.summary.trades += 1;
                if fee.is_finite() {
                    self.summary.fees_paid += fee;
                }
                info!(size, price, fee, trades = self.summary.trades, "fill");
            }
            FeedEvent::Balance {
                currency, balance, ..
            } => {
                if currency.eq_ignore_ascii_case(SETTLE_CURRENCY) {
                    self.set_balance(balance);
                }
            }
        }
    }

    /// Starts a cycle unless one is running or the throttle window is still open.
    pub fn on_tick(&mut self, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        self.latest_price = Some(price);

        if self.cycle_in_flight() {
            self.summary.dropped_ticks += 1;
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_cycle_at {
            if now.duration_since(last) < self.risk.refresh_interval {
                return;
            }
        }

        let sync = self
            .last_sync_at
            .map_or(true, |last| now.duration_since(last) >= self.sync_interval);
        if sync {
            self.last_sync_at = Some(now);
        }

        let input = CycleInput {
            price,
            positions: self.positions,
            params: self.params,
            ladder: self.ladder.with_sl_spread(self.risk.sl_spread),
            order_qty: self.order_qty,
            risk: self.risk_manager.clone(),
            sync,
        };
        self.cycle_revisions = self.revisions;
        self.cycles.spawn(run_cycle(
            Arc::clone(&self.gateway),
            Arc::clone(&self.pricing),
            input,
        ));
    }

    /// Waits for the in-flight cycle, if any, and applies its report.
    pub async fn finish_cycle(&mut self) {
        if let Some(joined) = self.cycles.join_next().await {
            self.on_cycle_joined(joined);
        }
    }

    fn on_cycle_joined(&mut self, joined: Result<CycleReport, JoinError>) {
        self.last_cycle_at = Some(Instant::now());
        match joined {
            Ok(report) => {
                if let Some(polled) = report.synced_positions {
                    for side in [PositionSide::Long, PositionSide::Short] {
                        if self.revisions.position(side) == self.cycle_revisions.position(side) {
                            self.positions.set(side, polled.get(side));
                        } else {
                            debug!(position_side = side.as_str(), "streamed position is newer than poll");
                        }
                    }
                }
                let stop_losses = report.stop_losses();
                if let Some(residuals) = report.synced_residuals {
                    if self.revisions.orders == self.cycle_revisions.orders {
                        self.residuals = residuals;
                    } else {
                        debug!("streamed orders are newer than poll");
                    }
                }
                self.summary.cycles += 1;
                self.summary.stop_losses += stop_losses;
            }
            Err(error) => error!(error = %error, "strategy cycle task failed"),
        }
    }

    pub fn apply_signal_update(&mut self, update: SignalUpdate) {
        match update {
            SignalUpdate::Refreshed(signals) => {
                self.params.apply_signals(&signals);
                self.risk = self.risk_controller.evaluate(signals.sigma);
                info!(
                    sigma = signals.sigma,
                    rsi = signals.rsi,
                    funding_rate = signals.funding_rate,
                    trend_alpha = signals.trend_alpha,
                    sl_spread = self.risk.sl_spread,
                    refresh_s = self.risk.refresh_interval.as_secs(),
                    "signals refreshed"
                );
            }
            SignalUpdate::Failed(reason) => {
                warn!(
                    reason = %reason,
                    retry_s = self.signal_backoff.as_secs(),
                    "signal refresh failed; keeping previous values"
                );
            }
        }
    }

    /// Epoch boundary: credit the equity change to the active arm and switch
    /// gamma. The first boundary only records the baseline.
    pub fn on_epoch(&mut self) {
        let Some(equity) = self.equity() else {
            warn!("equity unknown; skipping bandit epoch");
            return;
        };

        let Some(baseline) = self.equity_baseline else {
            self.equity_baseline = Some(equity);
            info!(equity, "bandit equity baseline set");
            return;
        };

        let reward = equity - baseline;
        self.bandit.update(reward);
        self.params.gamma = self.bandit.select_arm();
        self.equity_baseline = Some(equity);
        self.summary.epochs += 1;
        info!(reward, equity, gamma = self.params.gamma, "bandit epoch complete");
    }

    pub fn report(&self) {
        let uptime_s = self.started_at.elapsed().as_secs();
        let balance = self.balance.unwrap_or(0.0);
        let start = self.start_balance.unwrap_or(balance);

        info!(
            uptime_s,
            cycles = self.summary.cycles,
            dropped_ticks = self.summary.dropped_ticks,
            stop_losses = self.summary.stop_losses,
            epochs = self.summary.epochs,
            trades = self.summary.trades,
            fees_paid = self.summary.fees_paid,
            start_balance = start,
            balance,
            pnl = balance - start,
            equity = ?self.equity(),
            gamma = self.params.gamma,
            sl_spread = self.risk.sl_spread,
            long_qty = self.positions.long.quantity,
            short_qty = self.positions.short.quantity,
            long_open = self.residuals.total(PositionSide::Long, OrderPurpose::Entry),
            short_open = self.residuals.total(PositionSide::Short, OrderPurpose::Entry),
            "report"
        );
        for arm in self.bandit.arms() {
            info!(
                gamma = arm.value,
                count = arm.count,
                average_reward = arm.average_reward,
                "bandit arm"
            );
        }
    }

    fn set_balance(&mut self, balance: f64) {
        if !balance.is_finite() {
            return;
        }
        self.balance = Some(balance);
        self.start_balance.get_or_insert(balance);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::{run_cycle, CycleInput, SignalUpdate, StrategyEngine};
    use crate::config::{AppConfig, GeneralConfig, LadderConfig, RiskConfig};
    use crate::execution::{
        Gateway, OrderPurpose, OrderRequest, PaperGateway, PositionSide, Positions, Side,
        SidePosition,
    };
    use crate::marketdata::OrderUpdate;
    use crate::marketdata::FeedEvent;
    use crate::pricing::{AvellanedaStoikov, RiskParameters};
    use crate::risk::RiskManager;
    use crate::signals::{MarketSignals, StaticSignalService};

    fn config() -> AppConfig {
        AppConfig {
            general: GeneralConfig {
                symbol: "XRP".to_string(),
                order_qty: 1.0,
                leverage: 20,
                report_interval_s: 300,
                log_level: "info".to_string(),
            },
            marketdata: Default::default(),
            signals: Default::default(),
            pricing: Default::default(),
            ladder: Default::default(),
            risk: Default::default(),
            bandit: Default::default(),
            execution: Default::default(),
        }
    }

    fn engine(paper: Arc<PaperGateway>) -> StrategyEngine {
        let cfg = config();
        StrategyEngine::new(
            &cfg,
            paper,
            Arc::new(AvellanedaStoikov::new(cfg.pricing.clone(), cfg.general.order_qty)),
            Arc::new(StaticSignalService::default()),
        )
        .expect("engine")
    }

    #[tokio::test]
    async fn startup_clears_orders_and_bootstraps_state() {
        let paper = Arc::new(PaperGateway::new(500.0));
        paper
            .set_position(PositionSide::Long, SidePosition::new(2.0, 1.0))
            .await;
        paper
            .place_order(&OrderRequest::entry(PositionSide::Short, 2.0, 1.0))
            .await
            .unwrap();
        paper.fail_cancel_all(true).await;

        let mut engine = engine(Arc::clone(&paper));
        engine.startup().await.expect("startup");

        assert!(paper.fetch_open_orders().await.unwrap().is_empty());
        assert_eq!(engine.positions().long.quantity, 2.0);
        assert_eq!(engine.residuals().total(PositionSide::Short, OrderPurpose::Entry), 0.0);
        assert_eq!(engine.params().gamma, 0.1);
        assert_eq!(engine.equity(), None);

        engine.on_tick(1.5);
        assert_eq!(engine.equity(), Some(500.0 + 1.0));
    }

    #[tokio::test]
    async fn cycle_runs_both_mindsets() {
        let paper = Arc::new(PaperGateway::new(1_000.0));
        paper.on_price(100.0).await;
        let cfg = config();
        let input = CycleInput {
            price: 100.0,
            positions: Positions::default(),
            params: RiskParameters::from_signals(0.5, 0.02, &MarketSignals::default()),
            ladder: LadderConfig::default(),
            order_qty: 1.0,
            risk: RiskManager::from_config(&RiskConfig::default()),
            sync: true,
        };

        let report = run_cycle(
            paper.clone(),
            Arc::new(AvellanedaStoikov::new(cfg.pricing, 1.0)),
            input,
        )
        .await;

        assert_eq!(report.synced_positions, Some(Positions::default()));
        assert_eq!(report.long.as_ref().map(|o| o.entries_placed), Some(1));
        assert_eq!(report.short.as_ref().map(|o| o.entries_placed), Some(1));
        let open = paper.fetch_open_orders().await.unwrap();
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|o| o.price < 100.06 && o.price > 99.94));
    }

    #[tokio::test]
    async fn failing_mindset_leaves_other_side_untouched() {
        let paper = Arc::new(PaperGateway::new(1_000.0));
        paper.on_price(100.0).await;
        paper.fail_listing_for(Some(PositionSide::Long)).await;
        let cfg = config();
        let input = CycleInput {
            price: 100.0,
            positions: Positions::default(),
            params: RiskParameters::from_signals(0.5, 0.02, &MarketSignals::default()),
            ladder: LadderConfig::default(),
            order_qty: 1.0,
            risk: RiskManager::from_config(&RiskConfig::default()),
            sync: false,
        };

        let report = run_cycle(
            paper.clone(),
            Arc::new(AvellanedaStoikov::new(cfg.pricing, 1.0)),
            input,
        )
        .await;

        assert!(report.long.is_none());
        assert_eq!(report.short.as_ref().map(|o| o.entries_placed), Some(1));
        let open = paper.fetch_open_orders().await.unwrap();
        assert_eq!(open.len(), 1);
        assert!(open[0].belongs_to(PositionSide::Short, OrderPurpose::Entry));
    }

    #[tokio::test]
    async fn streamed_state_survives_an_older_poll() {
        let paper = Arc::new(PaperGateway::new(1_000.0));
        paper
            .set_position(PositionSide::Short, SidePosition::new(2.0, 100.0))
            .await;
        let mut engine = engine(Arc::clone(&paper));

        engine.on_tick(100.0);
        while paper.history().await.is_empty() {
            tokio::task::yield_now().await;
        }

        // a fill lands after the cycle polled the exchange
        paper
            .set_position(PositionSide::Long, SidePosition::new(5.0, 100.0))
            .await;
        engine.handle_event(FeedEvent::Position {
            side: PositionSide::Long,
            quantity: 5.0,
            entry_price: 100.0,
        });
        engine.handle_event(FeedEvent::Order(OrderUpdate {
            order_id: "900".to_string(),
            side: Side::Buy,
            reduce_only: false,
            remaining: 1.0,
        }));
        engine.finish_cycle().await;

        assert_eq!(engine.positions().long.quantity, 5.0);
        // untouched by the stream, so the poll applies
        assert_eq!(engine.positions().short.quantity, 2.0);
        assert_eq!(engine.residuals().total(PositionSide::Long, OrderPurpose::Entry), 1.0);
    }

    #[tokio::test]
    async fn own_fills_are_counted_with_fees() {
        let paper = Arc::new(PaperGateway::new(1_000.0));
        let mut engine = engine(paper);

        for fee in [0.01, 0.02] {
            engine.handle_event(FeedEvent::Trade {
                size: 1.0,
                price: 100.0,
                fee,
            });
        }
        assert_eq!(engine.summary().trades, 2);
        assert!((engine.summary().fees_paid - 0.03).abs() < 1e-12);
    }

    #[tokio::test]
    async fn ticks_during_cycle_are_dropped_and_throttled_after() {
        let paper = Arc::new(PaperGateway::new(1_000.0));
        let mut engine = engine(paper);

        engine.on_tick(100.0);
        assert!(engine.cycle_in_flight());
        engine.on_tick(100.1);
        assert_eq!(engine.summary().dropped_ticks, 1);

        engine.finish_cycle().await;
        assert!(!engine.cycle_in_flight());
        assert_eq!(engine.summary().cycles, 1);

        // still inside the re-quote window
        engine.on_tick(100.2);
        assert!(!engine.cycle_in_flight());
        assert_eq!(engine.latest_price(), Some(100.2));
    }

    #[tokio::test]
    async fn epoch_credits_equity_change_to_active_arm() {
        let paper = Arc::new(PaperGateway::new(1_000.0));
        let mut engine = engine(paper);
        engine.startup().await.expect("startup");
        let first_gamma = engine.params().gamma;

        engine.on_epoch();
        assert_eq!(engine.bandit().total_selections(), 0);

        engine.handle_event(FeedEvent::Price {
            price: 100.0,
            ts_ms: 0,
        });
        engine.finish_cycle().await;
        engine.on_epoch();
        assert_eq!(engine.bandit().total_selections(), 0);

        engine.handle_event(FeedEvent::Balance {
            currency: "USDT".to_string(),
            balance: 1_003.0,
            ts_ms: 0,
        });
        engine.on_epoch();

        let arm = engine.bandit().arms()[0];
        assert_eq!(arm.value, first_gamma);
        assert_eq!(arm.count, 1);
        assert!((arm.average_reward - 3.0).abs() < 1e-9);
        assert_eq!(engine.params().gamma, 0.3);
        assert_eq!(engine.summary().epochs, 1);
    }

    #[tokio::test]
    async fn signal_updates_drive_risk_settings() {
        let paper = Arc::new(PaperGateway::new(1_000.0));
        let mut engine = engine(paper);

        let signals = MarketSignals {
            sigma: 0.03,
            eta: 0.03,
            rsi: 72.0,
            ..MarketSignals::default()
        };
        engine.apply_signal_update(SignalUpdate::Refreshed(signals));
        assert_eq!(engine.risk_settings().sl_spread, 0.01);
        assert_eq!(engine.risk_settings().refresh_interval, Duration::from_secs(10));
        assert_eq!(engine.params().sigma, 0.03);
        assert_eq!(engine.params().rsi, 72.0);

        engine.apply_signal_update(SignalUpdate::Failed("timeout".to_string()));
        assert_eq!(engine.params().sigma, 0.03);
    }

    #[tokio::test]
    async fn run_loop_quotes_from_feed_until_shutdown() {
        let paper = Arc::new(PaperGateway::new(1_000.0));
        let mut engine = engine(Arc::clone(&paper));
        engine.startup().await.expect("startup");

        let (tx, rx) = mpsc::channel(16);
        paper.on_price(100.0).await;
        tx.send(FeedEvent::Price {
            price: 100.0,
            ts_ms: 0,
        })
        .await
        .unwrap();

        let summary = engine
            .run_until(rx, tokio::time::sleep(Duration::from_millis(200)))
            .await;
        assert_eq!(summary.cycles, 1);
        assert!(!paper.history().await.is_empty());
        drop(tx);
    }
}
