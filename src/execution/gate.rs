use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{Gateway, GatewayError, OpenOrder, OrderRequest, PositionSide, Positions, Side, SidePosition};
use crate::config::ExecutionConfig;
use crate::util::{
    append_hex_lower, decimal_string, ensure_rustls_crypto_provider, now_secs, quantize_price_ceil,
    quantize_price_floor,
};

pub const GATEIO_API_KEY_ENV: &str = "GATEIO_API_KEY";
pub const GATEIO_API_SECRET_ENV: &str = "GATEIO_API_SECRET";
const SETTLE: &str = "usdt";
const ERROR_BODY_SNIPPET_MAX_CHARS: usize = 300;

type HmacSha512 = Hmac<Sha512>;

#[derive(Clone)]
pub struct GateCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl GateCredentials {
    pub fn from_env() -> Result<Self, GatewayError> {
        let api_key = std::env::var(GATEIO_API_KEY_ENV)
            .map_err(|_| GatewayError::MissingCredentials(GATEIO_API_KEY_ENV))?;
        let api_secret = std::env::var(GATEIO_API_SECRET_ENV)
            .map_err(|_| GatewayError::MissingCredentials(GATEIO_API_SECRET_ENV))?;
        Ok(Self {
            api_key,
            api_secret,
        })
    }

    /// Hex HMAC-SHA512 of `payload`, as used by both REST and websocket auth.
    pub fn sign(&self, payload: &str) -> Result<String, GatewayError> {
        let mut mac = HmacSha512::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| GatewayError::Signature(e.to_string()))?;
        mac.update(payload.as_bytes());
        let digest = mac.finalize().into_bytes();

        let mut signature = String::with_capacity(digest.len() * 2);
        append_hex_lower(&digest, &mut signature);
        Ok(signature)
    }
}

impl std::fmt::Debug for GateCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateCredentials")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ContractSpec {
    tick_size: f64,
}

#[derive(Debug)]
struct SimpleRateLimiter {
    min_interval: Duration,
    next_allowed: Instant,
}

impl SimpleRateLimiter {
    fn new(rate_limit_per_s: u32) -> Self {
        let per_second = rate_limit_per_s.max(1) as f64;
        let min_interval = Duration::from_secs_f64(1.0 / per_second);
        Self {
            min_interval,
            next_allowed: Instant::now(),
        }
    }

    fn reserve_delay(&mut self) -> Duration {
        let now = Instant::now();
        let delay = self.next_allowed.saturating_duration_since(now);
        let base = self.next_allowed.max(now);
        self.next_allowed = base + self.min_interval;
        delay
    }
}

/// Signed REST client for Gate.io USDT-settled perpetuals in dual (hedge) mode.
#[derive(Clone)]
pub struct GateRestGateway {
    http: reqwest::Client,
    credentials: GateCredentials,
    base_url: String,
    path_prefix: String,
    contract: String,
    spec: ContractSpec,
    rate_limiter: Arc<Mutex<SimpleRateLimiter>>,
    order_counter: Arc<AtomicU64>,
}

impl GateRestGateway {
    /// Builds the client and loads the contract's tick size.
    pub async fn connect(
        cfg: &ExecutionConfig,
        contract: impl Into<String>,
        credentials: GateCredentials,
    ) -> Result<Self, GatewayError> {
        ensure_rustls_crypto_provider();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms()))
            .connect_timeout(Duration::from_millis(cfg.timeout_ms().min(2_000)))
            .tcp_nodelay(true)
            .build()?;

        let base_url = cfg.rest_base_url().to_string();
        let path_prefix = reqwest::Url::parse(&base_url)
            .map(|url| url.path().trim_end_matches('/').to_string())
            .map_err(|e| GatewayError::InvalidOrder(format!("bad rest url {base_url}: {e}")))?;

        let mut gateway = Self {
            http,
            credentials,
            base_url,
            path_prefix,
            contract: contract.into(),
            spec: ContractSpec { tick_size: 0.0 },
            rate_limiter: Arc::new(Mutex::new(SimpleRateLimiter::new(cfg.rate_limit_per_s()))),
            order_counter: Arc::new(AtomicU64::new(0)),
        };
        gateway.spec = gateway.fetch_contract_spec().await?;
        info!(
            contract = %gateway.contract,
            tick_size = gateway.spec.tick_size,
            testnet = cfg.testnet,
            "gate gateway ready"
        );
        Ok(gateway)
    }

    /// Switches the account to dual position mode and applies leverage.
    /// Failures are logged; the account may already be configured.
    pub async fn prepare_account(&self, leverage: u32) {
        let dual_mode = self
            .send_signed::<serde_json::Value>(
                Method::POST,
                &format!("/futures/{SETTLE}/dual_mode"),
                vec![("dual_mode", "true".to_string())],
                None,
            )
            .await;
        match dual_mode {
            Ok(_) => info!("dual position mode enabled"),
            Err(error) => warn!(error = %error, "could not enable dual position mode"),
        }

        let leverage_result = self
            .send_signed::<serde_json::Value>(
                Method::POST,
                &format!(
                    "/futures/{SETTLE}/dual_comp/positions/{}/leverage",
                    self.contract
                ),
                vec![("leverage", leverage.to_string())],
                None,
            )
            .await;
        match leverage_result {
            Ok(_) => info!(leverage, "leverage set"),
            Err(error) => warn!(leverage, error = %error, "could not set leverage"),
        }
    }

    async fn fetch_contract_spec(&self) -> Result<ContractSpec, GatewayError> {
        let url = format!("{}/futures/{SETTLE}/contracts/{}", self.base_url, self.contract);
        let response = self.http.get(url).send().await?;
        let payload: GateContract = parse_response(response).await?;
        let tick_size = parse_decimal(&payload.order_price_round).filter(|tick| *tick > 0.0);
        let tick_size = tick_size.ok_or_else(|| {
            GatewayError::InvalidOrder(format!(
                "contract {} has invalid order_price_round {}",
                self.contract, payload.order_price_round
            ))
        })?;
        Ok(ContractSpec { tick_size })
    }

    fn order_size(&self, request: &OrderRequest) -> Result<i64, GatewayError> {
        let contracts = request.qty.floor();
        if !contracts.is_finite() || contracts < 1.0 {
            return Err(GatewayError::InvalidOrder(format!(
                "qty {} is below one contract",
                request.qty
            )));
        }
        let contracts = contracts as i64;
        Ok(match request.side {
            Side::Buy => contracts,
            Side::Sell => -contracts,
        })
    }

    fn order_price(&self, request: &OrderRequest) -> Result<String, GatewayError> {
        let quantized = match request.side {
            Side::Buy => quantize_price_floor(request.price, self.spec.tick_size),
            Side::Sell => quantize_price_ceil(request.price, self.spec.tick_size),
        };
        match quantized {
            Some(price) if price > 0.0 => Ok(decimal_string(price)),
            _ => Err(GatewayError::InvalidOrder(format!(
                "price {} does not quantize to tick {}",
                request.price, self.spec.tick_size
            ))),
        }
    }

    fn next_client_text(&self) -> String {
        let n = self.order_counter.fetch_add(1, AtomicOrdering::Relaxed);
        format!("t-asg{}{}", now_secs(), n)
    }

    async fn send_signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: Vec<(&str, String)>,
        body: Option<String>,
    ) -> Result<T, GatewayError> {
        let delay = {
            let mut limiter = self.rate_limiter.lock().await;
            limiter.reserve_delay()
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let query_string = build_query_string(&query);
        let body = body.unwrap_or_default();
        let timestamp = now_secs().to_string();
        let signed_path = format!("{}{}", self.path_prefix, path);
        let payload = signature_payload(
            method.as_str(),
            &signed_path,
            &query_string,
            &body,
            &timestamp,
        );
        let signature = self.credentials.sign(&payload)?;

        let mut url = format!("{}{}", self.base_url, path);
        if !query_string.is_empty() {
            url.push('?');
            url.push_str(&query_string);
        }

        let mut builder = self
            .http
            .request(method.clone(), url)
            .header("KEY", &self.credentials.api_key)
            .header("Timestamp", &timestamp)
            .header("SIGN", signature)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json");
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let started = Instant::now();
        let response = builder.send().await?;
        debug!(
            method = %method,
            path,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "gate request"
        );
        parse_response(response).await
    }
}

#[async_trait]
impl Gateway for GateRestGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<String, GatewayError> {
        let body = GateOrderBody {
            contract: &self.contract,
            size: self.order_size(request)?,
            price: self.order_price(request)?,
            tif: "gtc",
            reduce_only: request.reduce_only,
            text: self.next_client_text(),
        };
        let body = serde_json::to_string(&body)?;

        let order: GateOrder = self
            .send_signed(
                Method::POST,
                &format!("/futures/{SETTLE}/orders"),
                vec![],
                Some(body),
            )
            .await?;
        Ok(order.id.to_string())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        let result = self
            .send_signed::<serde_json::Value>(
                Method::DELETE,
                &format!("/futures/{SETTLE}/orders/{order_id}"),
                vec![],
                None,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(error) if is_missing_order(&error) => Ok(()),
            Err(error) => Err(error),
        }
    }

    async fn cancel_all(&self) -> Result<usize, GatewayError> {
        let canceled: Vec<GateOrder> = self
            .send_signed(
                Method::DELETE,
                &format!("/futures/{SETTLE}/orders"),
                vec![("contract", self.contract.clone())],
                None,
            )
            .await?;
        Ok(canceled.len())
    }

    async fn fetch_open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        let orders: Vec<GateOrder> = self
            .send_signed(
                Method::GET,
                &format!("/futures/{SETTLE}/orders"),
                vec![
                    ("contract", self.contract.clone()),
                    ("status", "open".to_string()),
                ],
                None,
            )
            .await?;
        Ok(orders.into_iter().filter_map(GateOrder::into_open_order).collect())
    }

    async fn fetch_positions(&self) -> Result<Positions, GatewayError> {
        let rows: Vec<GatePosition> = self
            .send_signed(
                Method::GET,
                &format!("/futures/{SETTLE}/dual_comp/positions/{}", self.contract),
                vec![],
                None,
            )
            .await?;
        Ok(positions_from_rows(&rows))
    }

    async fn fetch_balance(&self) -> Result<f64, GatewayError> {
        let account: GateAccount = self
            .send_signed(
                Method::GET,
                &format!("/futures/{SETTLE}/accounts"),
                vec![],
                None,
            )
            .await?;
        parse_decimal(&account.total).ok_or_else(|| GatewayError::Api {
            status: 200,
            label: None,
            msg: format!("invalid account total {}", account.total),
        })
    }
}

#[derive(Debug, Serialize)]
struct GateOrderBody<'a> {
    contract: &'a str,
    size: i64,
    price: String,
    tif: &'static str,
    reduce_only: bool,
    text: String,
}

#[derive(Debug, Deserialize)]
struct GateOrder {
    id: i64,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    left: i64,
    #[serde(default)]
    price: String,
    #[serde(default)]
    is_reduce_only: bool,
}

impl GateOrder {
    fn into_open_order(self) -> Option<OpenOrder> {
        let side = match self.size {
            s if s > 0 => Side::Buy,
            s if s < 0 => Side::Sell,
            _ => return None,
        };
        Some(OpenOrder {
            id: self.id.to_string(),
            side,
            price: parse_decimal(&self.price).unwrap_or(0.0),
            remaining: self.left.unsigned_abs() as f64,
            reduce_only: self.is_reduce_only,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GatePosition {
    #[serde(default)]
    mode: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    entry_price: String,
}

#[derive(Debug, Deserialize)]
struct GateAccount {
    total: String,
}

#[derive(Debug, Deserialize)]
struct GateContract {
    order_price_round: String,
}

#[derive(Debug, Deserialize)]
struct GateErrorResponse {
    label: Option<String>,
    message: Option<String>,
}

fn positions_from_rows(rows: &[GatePosition]) -> Positions {
    let mut positions = Positions::default();
    for row in rows {
        let position = SidePosition::new(
            row.size.unsigned_abs() as f64,
            parse_decimal(&row.entry_price).unwrap_or(0.0),
        );
        match row.mode.as_str() {
            "dual_long" => positions.set(PositionSide::Long, position),
            "dual_short" => positions.set(PositionSide::Short, position),
            _ => {}
        }
    }
    positions
}

fn signature_payload(method: &str, path: &str, query: &str, body: &str, timestamp: &str) -> String {
    let body_hash = Sha512::digest(body.as_bytes());
    let mut hashed = String::with_capacity(body_hash.len() * 2);
    append_hex_lower(&body_hash, &mut hashed);
    format!("{method}\n{path}\n{query}\n{hashed}\n{timestamp}")
}

fn build_query_string(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn parse_decimal(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

fn body_snippet(body: &str) -> String {
    body.chars().take(ERROR_BODY_SNIPPET_MAX_CHARS).collect()
}

fn is_missing_order(error: &GatewayError) -> bool {
    match error {
        GatewayError::Api { status, label, .. } => {
            *status == StatusCode::NOT_FOUND.as_u16()
                || matches!(
                    label.as_deref(),
                    Some("ORDER_NOT_FOUND") | Some("ORDER_FINISHED")
                )
        }
        _ => false,
    }
}

async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, GatewayError> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        return serde_json::from_str(&body).map_err(GatewayError::from);
    }

    let (label, msg) = match serde_json::from_str::<GateErrorResponse>(&body) {
        Ok(payload) => (
            payload.label,
            payload.message.unwrap_or_else(|| body_snippet(&body)),
        ),
        Err(_) => (None, body_snippet(&body)),
    };

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(GatewayError::RateLimited(msg));
    }

    Err(GatewayError::Api {
        status: status.as_u16(),
        label,
        msg,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        build_query_string, is_missing_order, positions_from_rows, signature_payload,
        GateCredentials, GateOrder, GatePosition, GatewayError,
    };
    use crate::execution::{PositionSide, Side};

    #[test]
    fn signature_payload_hashes_empty_body() {
        let payload = signature_payload("GET", "/api/v4/futures/usdt/orders", "a=1", "", "1700000000");
        let lines: Vec<&str> = payload.split('\n').collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "GET");
        assert_eq!(lines[1], "/api/v4/futures/usdt/orders");
        assert_eq!(lines[2], "a=1");
        assert!(lines[3].starts_with("cf83e1357eefb8bd"));
        assert_eq!(lines[4], "1700000000");
    }

    #[test]
    fn signs_as_lowercase_hex() {
        let credentials = GateCredentials {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
        };
        let signature = credentials.sign("payload").expect("sign");
        assert_eq!(signature.len(), 128);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn joins_query_params() {
        let query = build_query_string(&[("contract", "XRP_USDT".to_string()), ("status", "open".to_string())]);
        assert_eq!(query, "contract=XRP_USDT&status=open");
    }

    #[test]
    fn parses_dual_mode_positions() {
        let rows: Vec<GatePosition> = serde_json::from_str(
            r#"[
                {"mode":"dual_long","size":3,"entry_price":"0.5123"},
                {"mode":"dual_short","size":-2,"entry_price":"0.5200"}
            ]"#,
        )
        .expect("rows parse");
        let positions = positions_from_rows(&rows);
        assert_eq!(positions.get(PositionSide::Long).quantity, 3.0);
        assert_eq!(positions.get(PositionSide::Short).quantity, 2.0);
        assert!((positions.short.entry_price - 0.52).abs() < 1e-12);
    }

    #[test]
    fn maps_signed_order_size_to_side() {
        let order: GateOrder = serde_json::from_str(
            r#"{"id":42,"size":-3,"left":-2,"price":"0.5300","is_reduce_only":true}"#,
        )
        .expect("order parse");
        let open = order.into_open_order().expect("open order");
        assert_eq!(open.side, Side::Sell);
        assert_eq!(open.remaining, 2.0);
        assert_eq!(open.position_side(), PositionSide::Long);
    }

    #[test]
    fn treats_missing_order_as_gone() {
        let error = GatewayError::Api {
            status: 404,
            label: Some("ORDER_NOT_FOUND".to_string()),
            msg: "order not found".to_string(),
        };
        assert!(is_missing_order(&error));
        assert!(!is_missing_order(&GatewayError::Rejected("x".to_string())));
    }
}
