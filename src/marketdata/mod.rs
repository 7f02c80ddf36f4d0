use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::MarketDataConfig;
use crate::execution::{GateCredentials, GatewayError, PositionSide, Side};
use crate::util::{ensure_rustls_crypto_provider, exponential_backoff_duration, now_millis, now_secs};

const PRIVATE_CHANNELS: [&str; 4] = [
    "futures.positions",
    "futures.orders",
    "futures.usertrades",
    "futures.balances",
];

/// Residual state of one order as reported by the stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub side: Side,
    pub reduce_only: bool,
    pub remaining: f64,
}

/// Typed event delivered by the streaming feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Price {
        price: f64,
        ts_ms: u128,
    },
    Position {
        side: PositionSide,
        quantity: f64,
        entry_price: f64,
    },
    Order(OrderUpdate),
    /// One own fill. `size` is signed: positive bought, negative sold.
    Trade {
        size: f64,
        price: f64,
        fee: f64,
    },
    Balance {
        currency: String,
        balance: f64,
        ts_ms: u128,
    },
}

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("unsupported marketdata.mode '{0}'; expected 'mock' or 'gateio_ws'")]
    InvalidMode(String),
    #[error("websocket connection error: {0}")]
    Connection(#[source] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("failed to parse json payload: {0}")]
    ParsePayload(#[source] Box<serde_json::Error>),
    #[error("websocket stream closed")]
    StreamClosed,
    #[error("subscription signing failed: {0}")]
    Signing(#[from] GatewayError),
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketDataError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(Box::new(error))
    }
}

impl From<serde_json::Error> for MarketDataError {
    fn from(error: serde_json::Error) -> Self {
        Self::ParsePayload(Box::new(error))
    }
}

/// Deterministic mark price that oscillates inside a band, for sandbox runs.
#[derive(Debug, Clone)]
pub struct MockMarketData {
    start_price: f64,
    interval_ms: u64,
    channel_buffer: usize,
}

impl MockMarketData {
    pub fn new(start_price: f64, interval_ms: u64) -> Self {
        Self {
            start_price,
            interval_ms,
            channel_buffer: 1_024,
        }
    }

    pub fn with_channel_buffer(mut self, channel_buffer: usize) -> Self {
        self.channel_buffer = channel_buffer.max(1);
        self
    }

    pub fn spawn(self) -> mpsc::Receiver<FeedEvent> {
        let (tx, rx) = mpsc::channel(self.channel_buffer);
        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_millis(self.interval_ms));
            let mut price = self.start_price;
            let mut direction = 1.0;
            let step = self.start_price * 0.0002;
            let upper = self.start_price * 1.01;
            let lower = self.start_price * 0.99;

            loop {
                interval.tick().await;
                price += step * direction;
                if price > upper {
                    direction = -1.0;
                } else if price < lower {
                    direction = 1.0;
                }

                let event = FeedEvent::Price {
                    price,
                    ts_ms: now_millis(),
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        rx
    }
}

/// Gate.io futures websocket: mark price plus private position, order, fill
/// and balance channels. Reconnects and resubscribes with capped exponential backoff.
#[derive(Debug, Clone)]
pub struct GateWsFeed {
    contract: String,
    ws_url: String,
    credentials: Option<GateCredentials>,
    reconnect_backoff_ms: u64,
    reconnect_backoff_max_ms: u64,
    ping_interval_s: u64,
    channel_buffer: usize,
}

impl GateWsFeed {
    pub fn from_config(
        contract: impl Into<String>,
        cfg: &MarketDataConfig,
        testnet: bool,
        credentials: Option<GateCredentials>,
    ) -> Self {
        let ws_url = if testnet {
            cfg.ws_testnet_url.clone()
        } else {
            cfg.ws_url.clone()
        };
        Self {
            contract: contract.into(),
            ws_url,
            credentials,
            reconnect_backoff_ms: cfg.reconnect_backoff_ms(),
            reconnect_backoff_max_ms: cfg.reconnect_backoff_max_ms(),
            ping_interval_s: cfg.ping_interval_s(),
            channel_buffer: cfg.channel_buffer(),
        }
    }

    pub fn spawn(self) -> mpsc::Receiver<FeedEvent> {
        ensure_rustls_crypto_provider();

        let (tx, rx) = mpsc::channel(self.channel_buffer);

        tokio::spawn(async move {
            let base = Duration::from_millis(self.reconnect_backoff_ms);
            let cap = Duration::from_millis(self.reconnect_backoff_max_ms);
            let mut attempt: u32 = 0;

            loop {
                if tx.is_closed() {
                    break;
                }

                match connect_async(self.ws_url.as_str()).await {
                    Ok((socket, _)) => {
                        info!(mode = "gateio_ws", contract = %self.contract, "marketdata connected");
                        attempt = 0;
                        if let Err(error) = self.run_socket(socket, &tx).await {
                            warn!(error = %error, "marketdata connection dropped");
                        }
                    }
                    Err(error) => {
                        warn!(error = %error, "marketdata connect failed");
                    }
                }

                if tx.is_closed() {
                    break;
                }

                attempt = attempt.saturating_add(1);
                let backoff = exponential_backoff_duration(base, attempt, cap);
                warn!(attempt, backoff_ms = backoff.as_millis() as u64, "marketdata reconnecting");
                time::sleep(backoff).await;
            }
        });

        rx
    }

    fn subscription(&self, channel: &str, ts: u64) -> Result<String, MarketDataError> {
        let payload = if channel == "futures.balances" {
            json!(["USDT"])
        } else {
            json!([self.contract])
        };
        let mut message = json!({
            "time": ts,
            "channel": channel,
            "event": "subscribe",
            "payload": payload,
        });

        if PRIVATE_CHANNELS.contains(&channel) {
            if let Some(credentials) = &self.credentials {
                let sign = credentials.sign(&format!("channel={channel}&event=subscribe&time={ts}"))?;
                message["auth"] = json!({
                    "method": "api_key",
                    "KEY": credentials.api_key,
                    "SIGN": sign,
                });
            }
        }

        Ok(message.to_string())
    }

    async fn run_socket(
        &self,
        mut socket: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        tx: &mpsc::Sender<FeedEvent>,
    ) -> Result<(), MarketDataError> {
        let ts = now_secs();
        let mut channels = vec!["futures.tickers"];
        if self.credentials.is_some() {
            channels.extend(PRIVATE_CHANNELS);
        }
        for channel in channels {
            let message = self.subscription(channel, ts)?;
            socket.send(Message::Text(message)).await?;
        }

        let mut ping_interval = time::interval(Duration::from_secs(self.ping_interval_s));
        ping_interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let mut dropped_prices: u64 = 0;

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    socket.send(Message::Ping(Vec::new())).await?;
                }
                maybe_msg = socket.next() => {
                    let Some(msg) = maybe_msg else {
                        return Err(MarketDataError::StreamClosed);
                    };
                    let msg = msg?;

                    if msg.is_ping() {
                        socket.send(Message::Pong(msg.into_data())).await?;
                        continue;
                    }
                    if msg.is_pong() {
                        continue;
                    }
                    if msg.is_close() {
                        return Err(MarketDataError::StreamClosed);
                    }
                    if !msg.is_text() {
                        continue;
                    }

                    let payload = msg.into_data();
                    let events = match parse_gate_message(&payload, &self.contract) {
                        Ok(events) => events,
                        Err(error) => {
                            debug!(error = %error, "skipping malformed feed payload");
                            continue;
                        }
                    };

                    for event in events {
                        let is_price = matches!(event, FeedEvent::Price { .. });
                        match tx.try_send(event) {
                            Ok(()) => {}
                            // Ticks are superseded by the next one; account updates must not be lost.
                            Err(TrySendError::Full(event)) if !is_price => {
                                if tx.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(TrySendError::Full(_)) => {
                                dropped_prices = dropped_prices.saturating_add(1);
                                if dropped_prices % 100 == 1 {
                                    warn!(dropped_prices, "feed channel full; dropping price ticks");
                                }
                            }
                            Err(TrySendError::Closed(_)) => return Ok(()),
                        }
                    }
                }
            }
        }
    }
}

pub fn spawn_feed(
    cfg: &MarketDataConfig,
    contract: impl Into<String>,
    testnet: bool,
    credentials: Option<GateCredentials>,
) -> Result<mpsc::Receiver<FeedEvent>, MarketDataError> {
    match cfg.mode.trim().to_ascii_lowercase().as_str() {
        "mock" => Ok(MockMarketData::new(cfg.mock_start_price, cfg.interval_ms())
            .with_channel_buffer(cfg.channel_buffer())
            .spawn()),
        "gateio_ws" => Ok(GateWsFeed::from_config(contract, cfg, testnet, credentials).spawn()),
        _ => Err(MarketDataError::InvalidMode(cfg.mode.clone())),
    }
}

/// Decodes one Gate futures websocket frame into feed events for `contract`.
pub fn parse_gate_message(payload: &[u8], contract: &str) -> Result<Vec<FeedEvent>, MarketDataError> {
    let message: JsonValue = serde_json::from_slice(payload)?;
    if message.get("event").and_then(JsonValue::as_str) != Some("update") {
        return Ok(Vec::new());
    }

    let channel = message
        .get("channel")
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    let Some(rows) = message.get("result").and_then(JsonValue::as_array) else {
        return Ok(Vec::new());
    };
    let ts_ms = now_millis();

    let same_contract = |row: &JsonValue| {
        row.get("contract")
            .and_then(JsonValue::as_str)
            .map_or(true, |c| c.eq_ignore_ascii_case(contract))
    };

    let mut events = Vec::new();
    match channel {
        "futures.tickers" => {
            for row in rows.iter().filter(|row| same_contract(row)) {
                let price = number_field(row, "mark_price")
                    .filter(|p| *p > 0.0)
                    .or_else(|| number_field(row, "last"));
                if let Some(price) = price.filter(|p| *p > 0.0) {
                    events.push(FeedEvent::Price { price, ts_ms });
                }
            }
        }
        "futures.positions" => {
            for row in rows.iter().filter(|row| same_contract(row)) {
                let side = match row.get("mode").and_then(JsonValue::as_str) {
                    Some("dual_long") => PositionSide::Long,
                    Some("dual_short") => PositionSide::Short,
                    _ => continue,
                };
                events.push(FeedEvent::Position {
                    side,
                    quantity: number_field(row, "size").unwrap_or(0.0).abs(),
                    entry_price: number_field(row, "entry_price").unwrap_or(0.0),
                });
            }
        }
        "futures.orders" => {
            for row in rows.iter().filter(|row| same_contract(row)) {
                let Some(reduce_only) = row.get("is_reduce_only").and_then(JsonValue::as_bool) else {
                    continue;
                };
                let size = number_field(row, "size").unwrap_or(0.0);
                let side = if size > 0.0 { Side::Buy } else { Side::Sell };
                let order_id = row
                    .get("id")
                    .map(|id| match id {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default();
                events.push(FeedEvent::Order(OrderUpdate {
                    order_id,
                    side,
                    reduce_only,
                    remaining: number_field(row, "left").unwrap_or(0.0).abs(),
                }));
            }
        }
        "futures.usertrades" => {
            for row in rows.iter().filter(|row| same_contract(row)) {
                let (Some(size), Some(price)) = (number_field(row, "size"), number_field(row, "price")) else {
                    continue;
                };
                events.push(FeedEvent::Trade {
                    size,
                    price,
                    fee: number_field(row, "fee").unwrap_or(0.0),
                });
            }
        }
        "futures.balances" => {
            for row in rows {
                let Some(balance) = number_field(row, "balance") else {
                    continue;
                };
                let currency = row
                    .get("currency")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("USDT")
                    .to_ascii_uppercase();
                events.push(FeedEvent::Balance {
                    currency,
                    balance,
                    ts_ms,
                });
            }
        }
        _ => {}
    }

    Ok(events)
}

fn number_field(row: &JsonValue, key: &str) -> Option<f64> {
    let value = row.get(key)?;
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::{parse_gate_message, FeedEvent, GateWsFeed};
    use crate::config::MarketDataConfig;
    use crate::execution::{GateCredentials, PositionSide, Side};

    #[test]
    fn parses_ticker_mark_price() {
        let payload = r#"{
            "time":1700000000,
            "channel":"futures.tickers",
            "event":"update",
            "result":[{"contract":"XRP_USDT","last":"0.5231","mark_price":"0.5229"}]
        }"#;

        let events = parse_gate_message(payload.as_bytes(), "XRP_USDT").expect("parse");
        assert_eq!(events.len(), 1);
        match &events[0] {
            FeedEvent::Price { price, .. } => assert!((price - 0.5229).abs() < 1e-12),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn ignores_other_contracts_and_subscribe_acks() {
        let ack = r#"{"time":1,"channel":"futures.tickers","event":"subscribe","result":{"status":"success"}}"#;
        assert!(parse_gate_message(ack.as_bytes(), "XRP_USDT").unwrap().is_empty());

        let other = r#"{
            "channel":"futures.tickers","event":"update",
            "result":[{"contract":"BTC_USDT","last":"43000"}]
        }"#;
        assert!(parse_gate_message(other.as_bytes(), "XRP_USDT").unwrap().is_empty());
    }

    #[test]
    fn parses_dual_mode_positions() {
        let payload = r#"{
            "channel":"futures.positions","event":"update",
            "result":[
                {"contract":"XRP_USDT","mode":"dual_long","size":4,"entry_price":0.51},
                {"contract":"XRP_USDT","mode":"dual_short","size":-2,"entry_price":0.53}
            ]
        }"#;

        let events = parse_gate_message(payload.as_bytes(), "XRP_USDT").expect("parse");
        assert_eq!(
            events[0],
            FeedEvent::Position {
                side: PositionSide::Long,
                quantity: 4.0,
                entry_price: 0.51
            }
        );
        assert_eq!(
            events[1],
            FeedEvent::Position {
                side: PositionSide::Short,
                quantity: 2.0,
                entry_price: 0.53
            }
        );
    }

    #[test]
    fn parses_order_residuals() {
        let payload = r#"{
            "channel":"futures.orders","event":"update",
            "result":[{"contract":"XRP_USDT","id":77,"size":-3,"left":-1,"is_reduce_only":true}]
        }"#;

        let events = parse_gate_message(payload.as_bytes(), "XRP_USDT").expect("parse");
        match &events[0] {
            FeedEvent::Order(update) => {
                assert_eq!(update.order_id, "77");
                assert_eq!(update.side, Side::Sell);
                assert!(update.reduce_only);
                assert_eq!(update.remaining, 1.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn parses_own_fills_with_fees() {
        let payload = r#"{
            "channel":"futures.usertrades","event":"update",
            "result":[
                {"contract":"XRP_USDT","id":"9","order_id":"77","size":-2,"price":"0.5301","fee":"0.000212","role":"maker"},
                {"contract":"XRP_USDT","id":"10","size":1}
            ]
        }"#;

        let events = parse_gate_message(payload.as_bytes(), "XRP_USDT").expect("parse");
        assert_eq!(
            events,
            vec![FeedEvent::Trade {
                size: -2.0,
                price: 0.5301,
                fee: 0.000212
            }]
        );
    }

    #[test]
    fn signs_private_subscriptions_only() {
        let feed = GateWsFeed::from_config(
            "XRP_USDT",
            &MarketDataConfig::default(),
            true,
            Some(GateCredentials {
                api_key: "k".to_string(),
                api_secret: "s".to_string(),
            }),
        );

        let public = feed.subscription("futures.tickers", 1).expect("public");
        assert!(!public.contains("auth"));

        let fills = feed.subscription("futures.usertrades", 1).expect("fills");
        assert!(fills.contains("auth"));

        let private = feed.subscription("futures.balances", 1).expect("private");
        let value: serde_json::Value = serde_json::from_str(&private).unwrap();
        assert_eq!(value["payload"][0], "USDT");
        assert_eq!(value["auth"]["KEY"], "k");
        assert_eq!(value["auth"]["SIGN"].as_str().unwrap().len(), 128);
    }
}
