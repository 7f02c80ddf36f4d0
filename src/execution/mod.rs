use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::marketdata::{FeedEvent, OrderUpdate};
use crate::util::now_millis;

mod gate;

pub use gate::{GateCredentials, GateRestGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// Hedge-mode position leg. Long and short are tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn entry_side(self) -> Side {
        match self {
            Self::Long => Side::Buy,
            Self::Short => Side::Sell,
        }
    }

    pub fn close_side(self) -> Side {
        match self {
            Self::Long => Side::Sell,
            Self::Short => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    /// Resolves which leg an order works on from its direction and reduce-only flag.
    pub fn of_order(side: Side, reduce_only: bool) -> Self {
        match (side, reduce_only) {
            (Side::Buy, false) | (Side::Sell, true) => Self::Long,
            (Side::Sell, false) | (Side::Buy, true) => Self::Short,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPurpose {
    Entry,
    Close,
}

impl OrderPurpose {
    pub fn from_reduce_only(reduce_only: bool) -> Self {
        if reduce_only {
            Self::Close
        } else {
            Self::Entry
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub reduce_only: bool,
    pub position_side: PositionSide,
}

impl OrderRequest {
    pub fn entry(position_side: PositionSide, price: f64, qty: f64) -> Self {
        Self {
            side: position_side.entry_side(),
            price,
            qty,
            reduce_only: false,
            position_side,
        }
    }

    pub fn close(position_side: PositionSide, price: f64, qty: f64) -> Self {
        Self {
            side: position_side.close_side(),
            price,
            qty,
            reduce_only: true,
            position_side,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub id: String,
    pub side: Side,
    pub price: f64,
    pub remaining: f64,
    pub reduce_only: bool,
}

impl OpenOrder {
    pub fn position_side(&self) -> PositionSide {
        PositionSide::of_order(self.side, self.reduce_only)
    }

    pub fn purpose(&self) -> OrderPurpose {
        OrderPurpose::from_reduce_only(self.reduce_only)
    }

    pub fn belongs_to(&self, position_side: PositionSide, purpose: OrderPurpose) -> bool {
        self.position_side() == position_side && self.purpose() == purpose
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SidePosition {
    pub quantity: f64,
    pub entry_price: f64,
}

impl SidePosition {
    pub fn new(quantity: f64, entry_price: f64) -> Self {
        Self {
            quantity: quantity.abs(),
            entry_price: entry_price.max(0.0),
        }
    }

    pub fn is_open(&self) -> bool {
        self.quantity > 0.0
    }

    /// False when the venue reported size but no usable entry price.
    pub fn has_entry_price(&self) -> bool {
        self.entry_price > 0.0
    }

    pub fn unrealized_pnl(&self, position_side: PositionSide, price: f64) -> f64 {
        if !self.is_open() {
            return 0.0;
        }
        match position_side {
            PositionSide::Long => (price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - price) * self.quantity,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Positions {
    pub long: SidePosition,
    pub short: SidePosition,
}

impl Positions {
    pub fn get(&self, position_side: PositionSide) -> SidePosition {
        match position_side {
            PositionSide::Long => self.long,
            PositionSide::Short => self.short,
        }
    }

    pub fn set(&mut self, position_side: PositionSide, position: SidePosition) {
        match position_side {
            PositionSide::Long => self.long = position,
            PositionSide::Short => self.short = position,
        }
    }

    /// Net inventory: long quantity minus short quantity.
    pub fn inventory(&self) -> f64 {
        self.long.quantity - self.short.quantity
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.long.unrealized_pnl(PositionSide::Long, price)
            + self.short.unrealized_pnl(PositionSide::Short, price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct RestingResidual {
    position_side: PositionSide,
    purpose: OrderPurpose,
    remaining: f64,
}

/// Open residual quantity of every known order, keyed by order id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderResiduals {
    orders: BTreeMap<String, RestingResidual>,
}

impl OrderResiduals {
    pub fn from_open_orders(orders: &[OpenOrder]) -> Self {
        let mut residuals = Self::default();
        for order in orders {
            residuals.track(
                order.id.clone(),
                order.position_side(),
                order.purpose(),
                order.remaining,
            );
        }
        residuals
    }

    /// Replaces the residual of one order; a zero residual forgets it.
    pub fn apply_update(&mut self, update: &OrderUpdate) {
        self.track(
            update.order_id.clone(),
            PositionSide::of_order(update.side, update.reduce_only),
            OrderPurpose::from_reduce_only(update.reduce_only),
            update.remaining,
        );
    }

    pub fn total(&self, position_side: PositionSide, purpose: OrderPurpose) -> f64 {
        self.orders
            .values()
            .filter(|order| order.position_side == position_side && order.purpose == purpose)
            .map(|order| order.remaining)
            .sum()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    fn track(
        &mut self,
        order_id: String,
        position_side: PositionSide,
        purpose: OrderPurpose,
        remaining: f64,
    ) {
        let remaining = remaining.abs();
        if !remaining.is_finite() || remaining <= 0.0 {
            self.orders.remove(&order_id);
            return;
        }
        self.orders.insert(
            order_id,
            RestingResidual {
                position_side,
                purpose,
                remaining,
            },
        );
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("missing required env var {0}")]
    MissingCredentials(&'static str),
    #[error("http request error: {0}")]
    Http(#[source] Box<reqwest::Error>),
    #[error("json parse error: {0}")]
    Json(#[source] Box<serde_json::Error>),
    #[error("signature error: {0}")]
    Signature(String),
    #[error("gate api error (status={status}, label={label:?}): {msg}")]
    Api {
        status: u16,
        label: Option<String>,
        msg: String,
    },
    #[error("gate rate limit: {0}")]
    RateLimited(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        Self::Http(Box::new(error))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(Box::new(error))
    }
}

/// Order placement and account queries against one contract.
///
/// Every call is fallible and safe to retry; cancelling an order that no
/// longer exists succeeds.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<String, GatewayError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError>;

    /// Bulk-cancels every resting order on the contract, returning how many were removed.
    async fn cancel_all(&self) -> Result<usize, GatewayError>;

    async fn fetch_open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError>;

    /// Resting orders working one leg for one purpose.
    async fn fetch_side_orders(
        &self,
        position_side: PositionSide,
        purpose: OrderPurpose,
    ) -> Result<Vec<OpenOrder>, GatewayError> {
        let orders = self.fetch_open_orders().await?;
        Ok(orders
            .into_iter()
            .filter(|order| order.belongs_to(position_side, purpose))
            .collect())
    }

    async fn fetch_positions(&self) -> Result<Positions, GatewayError>;

    /// Settlement-currency account balance, excluding unrealized PnL.
    async fn fetch_balance(&self) -> Result<f64, GatewayError>;
}

/// Clears resting orders at startup: bulk cancel first, then enumerate and
/// cancel one by one if the bulk call fails.
pub async fn clear_resting_orders(gateway: &dyn Gateway) -> Result<usize, GatewayError> {
    match gateway.cancel_all().await {
        Ok(count) => {
            info!(canceled = count, "all open orders cancelled");
            return Ok(count);
        }
        Err(error) => {
            warn!(error = %error, "bulk cancel failed; cancelling open orders individually");
        }
    }

    let orders = gateway.fetch_open_orders().await?;
    let mut canceled = 0usize;
    for order in &orders {
        match gateway.cancel_order(&order.id).await {
            Ok(()) => canceled += 1,
            Err(error) => warn!(order_id = %order.id, error = %error, "failed to cancel stale order"),
        }
    }
    info!(canceled, found = orders.len(), "manually cancelled stale orders");
    Ok(canceled)
}

#[derive(Debug, Default)]
struct PaperBook {
    next_id: u64,
    orders: BTreeMap<u64, OpenOrder>,
    positions: Positions,
    balance: f64,
    mark: Option<f64>,
    fee_rate: f64,
    history: Vec<OrderRequest>,
    reject_next_places: usize,
    fail_cancel_all: bool,
    fail_listing_for: Option<PositionSide>,
}

/// In-memory hedge-mode exchange used for sandbox runs and tests.
///
/// Resting orders fill at their limit price when the mark crosses them;
/// orders that are marketable on arrival fill immediately at the mark.
/// Every fill pays `fee_rate` of its notional out of the balance.
#[derive(Debug)]
pub struct PaperGateway {
    book: Mutex<PaperBook>,
    events: Option<mpsc::Sender<FeedEvent>>,
}

impl PaperGateway {
    pub fn new(balance: f64) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                next_id: 1,
                balance,
                ..PaperBook::default()
            }),
            events: None,
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: f64) -> Self {
        self.book.get_mut().fee_rate = fee_rate.max(0.0);
        self
    }

    /// Routes fill, position, and balance updates into a feed channel.
    pub fn with_event_sink(mut self, events: mpsc::Sender<FeedEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn set_position(&self, position_side: PositionSide, position: SidePosition) {
        let mut book = self.book.lock().await;
        book.positions.set(position_side, position);
    }

    pub async fn reject_next_places(&self, count: usize) {
        let mut book = self.book.lock().await;
        book.reject_next_places = count;
    }

    pub async fn fail_cancel_all(&self, fail: bool) {
        let mut book = self.book.lock().await;
        book.fail_cancel_all = fail;
    }

    /// Makes per-side order listing fail for `position_side`.
    pub async fn fail_listing_for(&self, position_side: Option<PositionSide>) {
        let mut book = self.book.lock().await;
        book.fail_listing_for = position_side;
    }

    /// Every order request accepted or rejected so far, in arrival order.
    pub async fn history(&self) -> Vec<OrderRequest> {
        let book = self.book.lock().await;
        book.history.clone()
    }

    pub async fn clear_history(&self) {
        let mut book = self.book.lock().await;
        book.history.clear();
    }

    /// Applies a new mark price and fills any resting order it crosses.
    pub async fn on_price(&self, price: f64) {
        let events = {
            let mut book = self.book.lock().await;
            book.mark = Some(price);

            let crossed: Vec<u64> = book
                .orders
                .iter()
                .filter(|(_, order)| crosses(order.side, order.price, price))
                .map(|(id, _)| *id)
                .collect();

            let mut events = Vec::new();
            for id in crossed {
                if let Some(order) = book.orders.remove(&id) {
                    let fill_price = order.price;
                    events.extend(fill(&mut book, &order, fill_price));
                }
            }
            events
        };

        self.emit(events);
    }

    fn emit(&self, events: Vec<FeedEvent>) {
        let Some(sink) = &self.events else {
            return;
        };
        for event in events {
            if let Err(error) = sink.try_send(event) {
                debug!(error = %error, "paper gateway event dropped");
            }
        }
    }
}

#[async_trait]
impl Gateway for PaperGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<String, GatewayError> {
        if !request.price.is_finite() || request.price <= 0.0 {
            return Err(GatewayError::InvalidOrder(format!(
                "price must be > 0, got {}",
                request.price
            )));
        }
        if !request.qty.is_finite() || request.qty <= 0.0 {
            return Err(GatewayError::InvalidOrder(format!(
                "qty must be > 0, got {}",
                request.qty
            )));
        }

        let (order_id, events) = {
            let mut book = self.book.lock().await;
            book.history.push(request.clone());

            if book.reject_next_places > 0 {
                book.reject_next_places -= 1;
                return Err(GatewayError::Rejected("paper rejection".to_string()));
            }

            if request.reduce_only && !book.positions.get(request.position_side).is_open() {
                return Err(GatewayError::Rejected(format!(
                    "reduce-only order with no {} position",
                    request.position_side.as_str()
                )));
            }

            let id = book.next_id;
            book.next_id += 1;
            let order = OpenOrder {
                id: id.to_string(),
                side: request.side,
                price: request.price,
                remaining: request.qty,
                reduce_only: request.reduce_only,
            };

            match book.mark {
                Some(mark) if crosses(order.side, order.price, mark) => {
                    let events = fill(&mut book, &order, mark);
                    (order.id, events)
                }
                _ => {
                    book.orders.insert(id, order.clone());
                    (order.id, Vec::new())
                }
            }
        };

        self.emit(events);
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        let mut book = self.book.lock().await;
        if let Ok(id) = order_id.parse::<u64>() {
            book.orders.remove(&id);
        }
        Ok(())
    }

    async fn cancel_all(&self) -> Result<usize, GatewayError> {
        let mut book = self.book.lock().await;
        if book.fail_cancel_all {
            return Err(GatewayError::Rejected("bulk cancel unavailable".to_string()));
        }
        let count = book.orders.len();
        book.orders.clear();
        Ok(count)
    }

    async fn fetch_open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        let book = self.book.lock().await;
        Ok(book.orders.values().cloned().collect())
    }

    async fn fetch_side_orders(
        &self,
        position_side: PositionSide,
        purpose: OrderPurpose,
    ) -> Result<Vec<OpenOrder>, GatewayError> {
        let book = self.book.lock().await;
        if book.fail_listing_for == Some(position_side) {
            return Err(GatewayError::Api {
                status: 503,
                label: None,
                msg: format!("paper listing unavailable for {}", position_side.as_str()),
            });
        }
        Ok(book
            .orders
            .values()
            .filter(|order| order.belongs_to(position_side, purpose))
            .cloned()
            .collect())
    }

    async fn fetch_positions(&self) -> Result<Positions, GatewayError> {
        let book = self.book.lock().await;
        Ok(book.positions)
    }

    async fn fetch_balance(&self) -> Result<f64, GatewayError> {
        let book = self.book.lock().await;
        Ok(book.balance)
    }
}

fn crosses(side: Side, limit: f64, mark: f64) -> bool {
    match side {
        Side::Buy => mark <= limit,
        Side::Sell => mark >= limit,
    }
}

fn fill(book: &mut PaperBook, order: &OpenOrder, price: f64) -> Vec<FeedEvent> {
    let position_side = order.position_side();
    let current = book.positions.get(position_side);
    let ts_ms = now_millis();
    let fee = (order.remaining * price).abs() * book.fee_rate;
    book.balance -= fee;

    let updated = if order.reduce_only {
        let qty = order.remaining.min(current.quantity);
        let realized = match position_side {
            PositionSide::Long => (price - current.entry_price) * qty,
            PositionSide::Short => (current.entry_price - price) * qty,
        };
        book.balance += realized;
        let remaining = current.quantity - qty;
        if remaining > 0.0 {
            SidePosition::new(remaining, current.entry_price)
        } else {
            SidePosition::default()
        }
    } else {
        let quantity = current.quantity + order.remaining;
        let entry_price =
            (current.entry_price * current.quantity + price * order.remaining) / quantity;
        SidePosition::new(quantity, entry_price)
    };
    book.positions.set(position_side, updated);

    info!(
        side = order.side.as_str(),
        position_side = position_side.as_str(),
        reduce_only = order.reduce_only,
        qty = order.remaining,
        price,
        fee,
        "paper fill"
    );

    let signed_size = match order.side {
        Side::Buy => order.remaining,
        Side::Sell => -order.remaining,
    };

    vec![
        FeedEvent::Trade {
            size: signed_size,
            price,
            fee,
        },
        FeedEvent::Position {
            side: position_side,
            quantity: updated.quantity,
            entry_price: updated.entry_price,
        },
        FeedEvent::Order(OrderUpdate {
            order_id: order.id.clone(),
            side: order.side,
            reduce_only: order.reduce_only,
            remaining: 0.0,
        }),
        FeedEvent::Balance {
            currency: "USDT".to_string(),
            balance: book.balance,
            ts_ms,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::{
        clear_resting_orders, Gateway, OpenOrder, OrderPurpose, OrderRequest, OrderResiduals,
        PaperGateway, PositionSide, Positions, Side, SidePosition,
    };
    use crate::marketdata::{FeedEvent, OrderUpdate};
    use tokio::sync::mpsc;

    fn open(id: &str, side: Side, reduce_only: bool, remaining: f64) -> OpenOrder {
        OpenOrder {
            id: id.to_string(),
            side,
            price: 100.0,
            remaining,
            reduce_only,
        }
    }

    #[test]
    fn maps_orders_to_hedge_legs() {
        assert!(open("1", Side::Buy, false, 1.0).belongs_to(PositionSide::Long, OrderPurpose::Entry));
        assert!(open("1", Side::Sell, true, 1.0).belongs_to(PositionSide::Long, OrderPurpose::Close));
        assert!(open("1", Side::Sell, false, 1.0).belongs_to(PositionSide::Short, OrderPurpose::Entry));
        assert!(open("1", Side::Buy, true, 1.0).belongs_to(PositionSide::Short, OrderPurpose::Close));
    }

    #[test]
    fn sums_residuals_per_leg() {
        let residuals = OrderResiduals::from_open_orders(&[
            open("1", Side::Buy, false, 1.0),
            open("2", Side::Buy, false, 2.0),
            open("3", Side::Buy, true, 3.0),
        ]);
        assert_eq!(residuals.total(PositionSide::Long, OrderPurpose::Entry), 3.0);
        assert_eq!(residuals.total(PositionSide::Short, OrderPurpose::Close), 3.0);
        assert_eq!(residuals.total(PositionSide::Long, OrderPurpose::Close), 0.0);
    }

    #[test]
    fn order_update_replaces_only_that_order() {
        let mut residuals = OrderResiduals::from_open_orders(&[
            open("10", Side::Buy, false, 1.0),
            open("11", Side::Buy, false, 1.0),
        ]);
        assert_eq!(residuals.total(PositionSide::Long, OrderPurpose::Entry), 2.0);

        residuals.apply_update(&OrderUpdate {
            order_id: "10".to_string(),
            side: Side::Buy,
            reduce_only: false,
            remaining: 0.0,
        });
        assert_eq!(residuals.total(PositionSide::Long, OrderPurpose::Entry), 1.0);
        assert_eq!(residuals.order_count(), 1);

        residuals.apply_update(&OrderUpdate {
            order_id: "12".to_string(),
            side: Side::Sell,
            reduce_only: true,
            remaining: 4.0,
        });
        residuals.apply_update(&OrderUpdate {
            order_id: "11".to_string(),
            side: Side::Buy,
            reduce_only: false,
            remaining: 0.5,
        });
        assert_eq!(residuals.total(PositionSide::Long, OrderPurpose::Entry), 0.5);
        assert_eq!(residuals.total(PositionSide::Long, OrderPurpose::Close), 4.0);
    }

    #[test]
    fn inventory_and_unrealized_pnl() {
        let positions = Positions {
            long: SidePosition::new(3.0, 100.0),
            short: SidePosition::new(1.0, 110.0),
        };
        assert_eq!(positions.inventory(), 2.0);
        assert!((positions.unrealized_pnl(105.0) - (15.0 + 5.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn paper_fills_resting_order_when_crossed() {
        let paper = PaperGateway::new(1_000.0);
        paper.on_price(100.0).await;
        paper
            .place_order(&OrderRequest::entry(PositionSide::Long, 99.0, 2.0))
            .await
            .expect("order accepted");
        assert_eq!(paper.fetch_open_orders().await.unwrap().len(), 1);

        paper.on_price(98.5).await;
        let positions = paper.fetch_positions().await.unwrap();
        assert_eq!(positions.long.quantity, 2.0);
        assert_eq!(positions.long.entry_price, 99.0);
        assert!(paper.fetch_open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn paper_rejects_reduce_only_without_position() {
        let paper = PaperGateway::new(1_000.0);
        let result = paper
            .place_order(&OrderRequest::close(PositionSide::Short, 99.0, 1.0))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn paper_close_realizes_pnl() {
        let paper = PaperGateway::new(1_000.0);
        paper
            .set_position(PositionSide::Long, SidePosition::new(2.0, 100.0))
            .await;
        paper.on_price(101.0).await;
        paper
            .place_order(&OrderRequest::close(PositionSide::Long, 100.0, 2.0))
            .await
            .expect("close accepted");

        let positions = paper.fetch_positions().await.unwrap();
        assert!(!positions.long.is_open());
        assert!((paper.fetch_balance().await.unwrap() - 1_002.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn paper_fill_charges_fee_and_reports_trade() {
        let (tx, mut rx) = mpsc::channel(16);
        let paper = PaperGateway::new(1_000.0)
            .with_fee_rate(0.001)
            .with_event_sink(tx);
        paper.on_price(100.0).await;
        paper
            .place_order(&OrderRequest::entry(PositionSide::Short, 100.0, 2.0))
            .await
            .expect("marketable entry fills");

        assert!((paper.fetch_balance().await.unwrap() - 999.8).abs() < 1e-9);
        match rx.recv().await {
            Some(FeedEvent::Trade { size, price, fee }) => {
                assert_eq!(size, -2.0);
                assert_eq!(price, 100.0);
                assert!((fee - 0.2).abs() < 1e-12);
            }
            other => panic!("expected trade event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn side_listing_fault_is_scoped_to_one_leg() {
        let paper = PaperGateway::new(1_000.0);
        paper
            .place_order(&OrderRequest::entry(PositionSide::Short, 110.0, 1.0))
            .await
            .unwrap();
        paper.fail_listing_for(Some(PositionSide::Long)).await;

        assert!(paper
            .fetch_side_orders(PositionSide::Long, OrderPurpose::Entry)
            .await
            .is_err());
        let short = paper
            .fetch_side_orders(PositionSide::Short, OrderPurpose::Entry)
            .await
            .expect("short listing");
        assert_eq!(short.len(), 1);
        assert_eq!(paper.fetch_open_orders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clear_falls_back_to_individual_cancels() {
        let paper = PaperGateway::new(1_000.0);
        paper
            .place_order(&OrderRequest::entry(PositionSide::Long, 90.0, 1.0))
            .await
            .unwrap();
        paper
            .place_order(&OrderRequest::entry(PositionSide::Short, 110.0, 1.0))
            .await
            .unwrap();
        paper.fail_cancel_all(true).await;

        let canceled = clear_resting_orders(&paper).await.expect("fallback succeeds");
        assert_eq!(canceled, 2);
        assert!(paper.fetch_open_orders().await.unwrap().is_empty());
    }
}
