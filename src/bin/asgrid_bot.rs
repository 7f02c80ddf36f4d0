use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use asgrid_mm::config::AppConfig;
use asgrid_mm::engine::StrategyEngine;
use asgrid_mm::execution::{GateCredentials, GateRestGateway, Gateway, PaperGateway};
use asgrid_mm::marketdata::{spawn_feed, FeedEvent};
use asgrid_mm::pricing::AvellanedaStoikov;
use asgrid_mm::signals::{build_signal_service, SignalService};
use asgrid_mm::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/default.toml".to_string());

    let cfg = AppConfig::load_from_path(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path))?;

    telemetry::init("asgrid_bot", &cfg.general.log_level);
    let contract = cfg.general.contract();
    info!(
        contract = %contract,
        venue = %cfg.execution.venue,
        testnet = cfg.execution.testnet,
        feed = %cfg.marketdata.mode,
        signals = %cfg.signals.source,
        "starting asgrid_bot"
    );

    let signals: Arc<dyn SignalService> = Arc::from(
        build_signal_service(&cfg.signals).context("failed to build signal service")?,
    );
    let pricing = Arc::new(AvellanedaStoikov::new(
        cfg.pricing.clone(),
        cfg.general.order_qty,
    ));

    let (gateway, feed): (Arc<dyn Gateway>, mpsc::Receiver<FeedEvent>) = if cfg.execution.is_paper() {
        let (tx, rx) = mpsc::channel(cfg.marketdata.channel_buffer());
        let paper = Arc::new(
            PaperGateway::new(cfg.execution.paper_balance)
                .with_fee_rate(cfg.execution.paper_fee_rate)
                .with_event_sink(tx.clone()),
        );
        let mut source = spawn_feed(&cfg.marketdata, contract.clone(), cfg.execution.testnet, None)
            .context("failed to start market data source")?;

        // Prices reach the paper book before the engine so resting orders fill first.
        let relay_book = Arc::clone(&paper);
        tokio::spawn(async move {
            while let Some(event) = source.recv().await {
                if let FeedEvent::Price { price, .. } = &event {
                    relay_book.on_price(*price).await;
                }
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            warn!("paper relay stopped");
        });
        let gateway: Arc<dyn Gateway> = paper;
        (gateway, rx)
    } else {
        let credentials =
            GateCredentials::from_env().context("live venue requires gate credentials")?;
        let gateway = GateRestGateway::connect(&cfg.execution, contract.clone(), credentials.clone())
            .await
            .context("failed to connect gate gateway")?;
        gateway.prepare_account(cfg.general.leverage).await;
        let feed = spawn_feed(
            &cfg.marketdata,
            contract.clone(),
            cfg.execution.testnet,
            Some(credentials),
        )
        .context("failed to start market data source")?;
        let gateway: Arc<dyn Gateway> = Arc::new(gateway);
        (gateway, feed)
    };

    let mut engine = StrategyEngine::new(&cfg, gateway, pricing, signals)
        .context("failed to build strategy engine")?;
    engine.startup().await.context("startup failed")?;

    let summary = engine.run(feed).await;
    info!(
        cycles = summary.cycles,
        dropped_ticks = summary.dropped_ticks,
        stop_losses = summary.stop_losses,
        epochs = summary.epochs,
        trades = summary.trades,
        fees_paid = summary.fees_paid,
        "asgrid_bot finished"
    );
    Ok(())
}
