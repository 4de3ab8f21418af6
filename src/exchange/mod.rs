use std::str::FromStr;
use std::sync::Once;
use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::Method;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

use crate::clock::now_local_ms;
use crate::config::{BybitConfig, Credentials};

const BAPI_KEY_HEADER: &str = "X-BAPI-API-KEY";
const BAPI_TIMESTAMP_HEADER: &str = "X-BAPI-TIMESTAMP";
const BAPI_RECV_WINDOW_HEADER: &str = "X-BAPI-RECV-WINDOW";
const BAPI_SIGN_HEADER: &str = "X-BAPI-SIGN";

const HTTP_TIMEOUT_MS: u64 = 2_000;
const HTTP_POOL_MAX_IDLE_PER_HOST: usize = 16;
const HTTP_TCP_KEEPALIVE_SECS: u64 = 30;

// Bybit "already set" answers for margin/leverage switches.
const RET_LEVERAGE_NOT_MODIFIED: i64 = 110_043;
const RET_MARGIN_MODE_NOT_MODIFIED: i64 = 110_026;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_bybit(self) -> &'static str {
        match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
        }
    }

    pub fn from_bybit(raw: &str) -> Option<Self> {
        match raw {
            "Buy" => Some(Self::Buy),
            "Sell" => Some(Self::Sell),
            _ => None,
        }
    }
}

/// Resolved symbol filters. Immutable once fetched.
#[derive(Debug, Clone)]
pub struct Instrument {
    pub symbol: String,
    pub tick: Decimal,
    pub step: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Option<Decimal>,
}

/// Limit IOC order, fully quantised. Price and quantity are decimal strings
/// so no float survives to the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderDraft {
    pub side: Side,
    pub qty: String,
    pub price: String,
    pub position_idx: u8,
    pub reduce_only: bool,
}

impl OrderDraft {
    pub fn sell_open(qty: String, price: String, position_idx: u8) -> Self {
        Self {
            side: Side::Sell,
            qty,
            price,
            position_idx,
            reduce_only: false,
        }
    }

    pub fn buy_close(qty: String, price: String, position_idx: u8) -> Self {
        Self {
            side: Side::Buy,
            qty,
            price,
            position_idx,
            reduce_only: true,
        }
    }

    pub fn with_position_idx(&self, position_idx: u8) -> Self {
        Self {
            position_idx,
            ..self.clone()
        }
    }

    pub fn to_args(&self, symbol: &str) -> JsonValue {
        json!({
            "category": "linear",
            "symbol": symbol,
            "side": self.side.as_bybit(),
            "orderType": "Limit",
            "qty": self.qty,
            "price": self.price,
            "timeInForce": "IOC",
            "reduceOnly": self.reduce_only,
            "positionIdx": self.position_idx,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub symbol: String,
    pub order_id: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub exec_time_ms: i64,
    pub fee_usdt: f64,
}

#[derive(Debug, Clone)]
pub struct FundingInfo {
    pub funding_rate: f64,
    pub next_funding_time_ms: i64,
    pub last_price: Option<f64>,
}

#[derive(Debug, Error)]
pub enum RestError {
    #[error("http request error: {0}")]
    Http(#[source] Box<reqwest::Error>),
    #[error("json parse error: {0}")]
    Json(#[source] Box<serde_json::Error>),
    #[error("bybit api error (retCode={ret_code}) on {path}: {msg}")]
    Api {
        ret_code: i64,
        msg: String,
        path: String,
    },
    #[error("signature error: {0}")]
    Signature(String),
    #[error("missing field {0} in response")]
    MissingField(&'static str),
    #[error("symbol {0} not found")]
    SymbolMissing(String),
    #[error("invalid instrument filter for {symbol}: {field}={value}")]
    FilterInvalid {
        symbol: String,
        field: &'static str,
        value: String,
    },
}

impl From<reqwest::Error> for RestError {
    fn from(error: reqwest::Error) -> Self {
        Self::Http(Box::new(error))
    }
}

impl From<serde_json::Error> for RestError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(Box::new(error))
    }
}

impl RestError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Http(source) if source.is_timeout())
    }
}

pub fn signature_hex(secret: &str, payload: &str) -> Result<String, RestError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| RestError::Signature(e.to_string()))?;
    mac.update(payload.as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut signature = String::with_capacity(digest.len() * 2);
    append_hex_lower(&digest, &mut signature);
    Ok(signature)
}

/// Login signature shared by the private and trade websocket channels:
/// HMAC-SHA256 over `GET/realtime{expires}`.
pub fn ws_login_signature(secret: &str, expires_ms: i64) -> Result<String, RestError> {
    signature_hex(secret, &format!("GET/realtime{expires_ms}"))
}

fn append_hex_lower(bytes: &[u8], out: &mut String) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ServerTimeResult {
    #[serde(rename = "timeNano", default)]
    time_nano: Option<String>,
    #[serde(rename = "timeSecond", default)]
    time_second: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct InstrumentItem {
    symbol: String,
    #[serde(rename = "priceFilter")]
    price_filter: PriceFilter,
    #[serde(rename = "lotSizeFilter")]
    lot_size_filter: LotSizeFilter,
}

#[derive(Debug, Deserialize)]
struct PriceFilter {
    #[serde(rename = "tickSize")]
    tick_size: String,
}

#[derive(Debug, Deserialize)]
struct LotSizeFilter {
    #[serde(rename = "qtyStep")]
    qty_step: String,
    #[serde(rename = "minOrderQty")]
    min_order_qty: String,
    #[serde(rename = "minNotionalValue", default)]
    min_notional_value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TickerItem {
    #[serde(rename = "lastPrice", default)]
    last_price: Option<String>,
    #[serde(rename = "fundingRate", default)]
    funding_rate: Option<String>,
    #[serde(rename = "nextFundingTime", default)]
    next_funding_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WalletAccount {
    #[serde(default = "Vec::new")]
    coin: Vec<WalletCoin>,
}

#[derive(Debug, Deserialize)]
struct WalletCoin {
    coin: String,
    #[serde(rename = "availableToWithdraw", default)]
    available_to_withdraw: Option<String>,
    #[serde(rename = "availableBalance", default)]
    available_balance: Option<String>,
    #[serde(rename = "walletBalance", default)]
    wallet_balance: Option<String>,
    #[serde(default)]
    equity: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PositionItem {
    #[serde(default)]
    side: String,
    #[serde(default)]
    size: String,
}

#[derive(Debug, Deserialize)]
struct ExecutionItem {
    #[serde(default)]
    symbol: String,
    #[serde(rename = "orderId", default)]
    order_id: String,
    #[serde(default)]
    side: String,
    #[serde(rename = "execQty", default)]
    exec_qty: String,
    #[serde(rename = "execPrice", default)]
    exec_price: String,
    #[serde(rename = "execTime", default)]
    exec_time: String,
    #[serde(rename = "execFee", default)]
    exec_fee: String,
}

#[derive(Debug, Deserialize)]
struct OrderCreateResult {
    #[serde(rename = "orderId")]
    order_id: String,
}

/// Signed Bybit v5 REST client. Serves preflight, the server-time probes,
/// and the post-trade fallbacks; doubles as the slow order channel when the
/// trade websocket is disabled.
#[derive(Clone)]
pub struct BybitRest {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
    rest_url: String,
    recv_window_ms: u64,
}

impl BybitRest {
    pub fn new(cfg: &BybitConfig, creds: &Credentials) -> Result<Self, RestError> {
        ensure_rustls_crypto_provider();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(HTTP_TIMEOUT_MS))
            .connect_timeout(Duration::from_millis(HTTP_TIMEOUT_MS.min(1_000)))
            .pool_max_idle_per_host(HTTP_POOL_MAX_IDLE_PER_HOST)
            .tcp_keepalive(Some(Duration::from_secs(HTTP_TCP_KEEPALIVE_SECS)))
            .tcp_nodelay(true)
            .http1_only()
            .build()?;

        Ok(Self {
            http,
            api_key: creds.api_key.clone(),
            api_secret: creds.api_secret.clone(),
            rest_url: cfg.rest_url.trim_end_matches('/').to_string(),
            recv_window_ms: cfg.recv_window_ms(),
        })
    }

    pub async fn server_time_ms(&self) -> Result<i64, RestError> {
        let result: ServerTimeResult = self.public_get("/v5/market/time", &[]).await?;

        if let Some(nanos) = result
            .time_nano
            .as_deref()
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|v| *v > 0)
        {
            return Ok(nanos / 1_000_000);
        }
        if let Some(secs) = result
            .time_second
            .as_deref()
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|v| *v > 0)
        {
            return Ok(secs * 1_000);
        }

        Err(RestError::MissingField("timeNano/timeSecond"))
    }

    pub async fn instrument(&self, symbol: &str) -> Result<Instrument, RestError> {
        let result: ListResult<InstrumentItem> = self
            .public_get(
                "/v5/market/instruments-info",
                &[("category", "linear"), ("symbol", symbol)],
            )
            .await?;

        let item = result
            .list
            .into_iter()
            .find(|it| it.symbol.eq_ignore_ascii_case(symbol))
            .ok_or_else(|| RestError::SymbolMissing(symbol.to_string()))?;

        let tick = parse_positive_decimal(symbol, "tickSize", &item.price_filter.tick_size)?;
        let step = parse_positive_decimal(symbol, "qtyStep", &item.lot_size_filter.qty_step)?;
        let min_qty =
            parse_positive_decimal(symbol, "minOrderQty", &item.lot_size_filter.min_order_qty)?;
        let min_notional = item
            .lot_size_filter
            .min_notional_value
            .as_deref()
            .and_then(|raw| Decimal::from_str(raw).ok())
            .filter(|v| *v > Decimal::ZERO);

        Ok(Instrument {
            symbol: item.symbol,
            tick,
            step,
            min_qty,
            min_notional,
        })
    }

    pub async fn funding_info(&self, symbol: &str) -> Result<FundingInfo, RestError> {
        let result: ListResult<TickerItem> = self
            .public_get(
                "/v5/market/tickers",
                &[("category", "linear"), ("symbol", symbol)],
            )
            .await?;

        let item = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| RestError::SymbolMissing(symbol.to_string()))?;

        let funding_rate = item
            .funding_rate
            .as_deref()
            .and_then(|raw| raw.parse::<f64>().ok())
            .ok_or(RestError::MissingField("fundingRate"))?;
        let next_funding_time_ms = item
            .next_funding_time
            .as_deref()
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .ok_or(RestError::MissingField("nextFundingTime"))?;
        let last_price = item
            .last_price
            .as_deref()
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|v| *v > 0.0);

        Ok(FundingInfo {
            funding_rate,
            next_funding_time_ms,
            last_price,
        })
    }

    /// Available USDT for derivatives. Tries UNIFIED then CONTRACT and the
    /// first usable balance field Bybit reports.
    pub async fn available_usdt(&self) -> Result<Option<f64>, RestError> {
        for account_type in ["UNIFIED", "CONTRACT"] {
            let result: Result<ListResult<WalletAccount>, RestError> = self
                .private_get(
                    "/v5/account/wallet-balance",
                    &[("accountType", account_type), ("coin", "USDT")],
                )
                .await;

            let accounts = match result {
                Ok(r) => r.list,
                Err(error) => {
                    warn!(account_type, error = %error, "wallet-balance fetch failed");
                    continue;
                }
            };

            for account in accounts {
                for coin in account.coin {
                    if !coin.coin.eq_ignore_ascii_case("USDT") {
                        continue;
                    }
                    let candidates = [
                        coin.available_to_withdraw.as_deref(),
                        coin.available_balance.as_deref(),
                        coin.wallet_balance.as_deref(),
                        coin.equity.as_deref(),
                    ];
                    for raw in candidates.into_iter().flatten() {
                        if let Ok(v) = raw.parse::<f64>() {
                            if v >= 0.0 {
                                return Ok(Some(v));
                            }
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    /// Current short size for the symbol, summed over hedge legs.
    pub async fn short_position_qty(&self, symbol: &str) -> Result<f64, RestError> {
        let result: ListResult<PositionItem> = self
            .private_get(
                "/v5/position/list",
                &[("category", "linear"), ("symbol", symbol)],
            )
            .await?;

        let mut short_qty = 0.0;
        for item in result.list {
            let size = item.size.parse::<f64>().unwrap_or(0.0);
            if size > 0.0 && item.side == "Sell" {
                short_qty += size.abs();
            }
        }
        Ok(short_qty)
    }

    pub async fn executions(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<ExecutionRecord>, RestError> {
        let start = start_ms.max(0).to_string();
        let end = end_ms.max(0).to_string();
        let limit = limit.clamp(1, 1_000).to_string();
        let result: ListResult<ExecutionItem> = self
            .private_get(
                "/v5/execution/list",
                &[
                    ("category", "linear"),
                    ("symbol", symbol),
                    ("startTime", &start),
                    ("endTime", &end),
                    ("limit", &limit),
                ],
            )
            .await?;

        let mut records = Vec::with_capacity(result.list.len());
        for item in result.list {
            let Some(side) = Side::from_bybit(&item.side) else {
                continue;
            };
            let qty = item.exec_qty.parse::<f64>().unwrap_or(0.0);
            let price = item.exec_price.parse::<f64>().unwrap_or(0.0);
            if qty <= 0.0 || price <= 0.0 {
                continue;
            }
            records.push(ExecutionRecord {
                symbol: item.symbol,
                order_id: item.order_id,
                side,
                qty,
                price,
                exec_time_ms: item.exec_time.parse::<i64>().unwrap_or(0),
                fee_usdt: item.exec_fee.parse::<f64>().unwrap_or(0.0).abs(),
            });
        }
        records.sort_by_key(|r| r.exec_time_ms);
        Ok(records)
    }

    /// Best-effort trading prep: isolated margin, leverage 1. "Already set"
    /// answers are success.
    pub async fn prepare_isolated_1x(&self, symbol: &str) -> Result<(), RestError> {
        let switch = json!({
            "category": "linear",
            "symbol": symbol,
            "tradeMode": 1,
            "buyLeverage": "1",
            "sellLeverage": "1",
        });
        match self
            .private_post::<JsonValue>("/v5/position/switch-isolated", &switch)
            .await
        {
            Ok(_) => {}
            Err(RestError::Api { ret_code, .. }) if ret_code == RET_MARGIN_MODE_NOT_MODIFIED => {}
            Err(error) => return Err(error),
        }

        let leverage = json!({
            "category": "linear",
            "symbol": symbol,
            "buyLeverage": "1",
            "sellLeverage": "1",
        });
        match self
            .private_post::<JsonValue>("/v5/position/set-leverage", &leverage)
            .await
        {
            Ok(_) => Ok(()),
            Err(RestError::Api { ret_code, .. }) if ret_code == RET_LEVERAGE_NOT_MODIFIED => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Slow-path order creation over REST. Same ambiguity caveat as the
    /// websocket channel: an error here does not prove the order died.
    pub async fn create_order(
        &self,
        symbol: &str,
        draft: &OrderDraft,
    ) -> Result<String, RestError> {
        let body = draft.to_args(symbol);
        let result: OrderCreateResult = self.private_post("/v5/order/create", &body).await?;
        Ok(result.order_id)
    }

    async fn public_get<T>(&self, path: &str, params: &[(&str, &str)]) -> Result<T, RestError>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.rest_url, path);
        let response = self.http.get(url).query(params).send().await?;
        let envelope: Envelope<T> = response.json().await?;
        unwrap_envelope(envelope, path)
    }

    async fn private_get<T>(&self, path: &str, params: &[(&str, &str)]) -> Result<T, RestError>
    where
        T: DeserializeOwned,
    {
        let query = build_query_string(params);
        let timestamp = now_local_ms();
        let signature = self.sign(timestamp, &query)?;

        let url = if query.is_empty() {
            format!("{}{}", self.rest_url, path)
        } else {
            format!("{}{}?{}", self.rest_url, path, query)
        };

        let response = self
            .http
            .request(Method::GET, url)
            .header(BAPI_KEY_HEADER, &self.api_key)
            .header(BAPI_TIMESTAMP_HEADER, timestamp.to_string())
            .header(BAPI_RECV_WINDOW_HEADER, self.recv_window_ms.to_string())
            .header(BAPI_SIGN_HEADER, signature)
            .send()
            .await?;
        let envelope: Envelope<T> = response.json().await?;
        unwrap_envelope(envelope, path)
    }

    async fn private_post<T>(&self, path: &str, body: &JsonValue) -> Result<T, RestError>
    where
        T: DeserializeOwned,
    {
        let payload = serde_json::to_string(body)?;
        let timestamp = now_local_ms();
        let signature = self.sign(timestamp, &payload)?;

        let response = self
            .http
            .request(Method::POST, format!("{}{}", self.rest_url, path))
            .header(BAPI_KEY_HEADER, &self.api_key)
            .header(BAPI_TIMESTAMP_HEADER, timestamp.to_string())
            .header(BAPI_RECV_WINDOW_HEADER, self.recv_window_ms.to_string())
            .header(BAPI_SIGN_HEADER, signature)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await?;
        let envelope: Envelope<T> = response.json().await?;
        unwrap_envelope(envelope, path)
    }

    fn sign(&self, timestamp: i64, payload: &str) -> Result<String, RestError> {
        let message = format!(
            "{}{}{}{}",
            timestamp, self.api_key, self.recv_window_ms, payload
        );
        signature_hex(&self.api_secret, &message)
    }
}

impl crate::orchestrator::TradeChannel for BybitRest {
    async fn create_order(
        &self,
        symbol: &str,
        draft: &OrderDraft,
        _server_ts_ms: i64,
        _timeout_ms: u64,
    ) -> Result<String, crate::tradews::TradeError> {
        // Slow path: the HTTP client's own timeout bounds the request.
        crate::tradews::create_with_idx_retry(draft, |attempt| async move {
            BybitRest::create_order(self, symbol, &attempt)
                .await
                .map_err(rest_to_trade_error)
        })
        .await
    }
}

fn rest_to_trade_error(error: RestError) -> crate::tradews::TradeError {
    use crate::tradews::TradeError;
    if error.is_timeout() {
        return TradeError::Timeout;
    }
    match error {
        RestError::Api { ret_code, msg, .. } => TradeError::Rejected { ret_code, msg },
        other => TradeError::Transport(other.to_string()),
    }
}

impl crate::orchestrator::PositionFallback for BybitRest {
    async fn short_position_qty(&self, symbol: &str) -> Option<f64> {
        match BybitRest::short_position_qty(self, symbol).await {
            Ok(qty) => Some(qty),
            Err(error) => {
                warn!(error = %error, "rest position fallback failed");
                None
            }
        }
    }

    async fn executions(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Vec<ExecutionRecord> {
        match BybitRest::executions(self, symbol, start_ms, end_ms, 200).await {
            Ok(records) => records,
            Err(error) => {
                warn!(error = %error, "rest execution fallback failed");
                Vec::new()
            }
        }
    }
}

fn unwrap_envelope<T>(envelope: Envelope<T>, path: &str) -> Result<T, RestError> {
    if envelope.ret_code != 0 {
        return Err(RestError::Api {
            ret_code: envelope.ret_code,
            msg: envelope.ret_msg,
            path: path.to_string(),
        });
    }
    envelope.result.ok_or(RestError::MissingField("result"))
}

fn parse_positive_decimal(
    symbol: &str,
    field: &'static str,
    raw: &str,
) -> Result<Decimal, RestError> {
    Decimal::from_str(raw)
        .ok()
        .filter(|v| *v > Decimal::ZERO)
        .ok_or_else(|| RestError::FilterInvalid {
            symbol: symbol.to_string(),
            field,
            value: raw.to_string(),
        })
}

fn build_query_string(params: &[(&str, &str)]) -> String {
    let mut query = String::new();
    for (idx, (key, value)) in params.iter().enumerate() {
        if idx > 0 {
            query.push('&');
        }
        query.push_str(key);
        query.push('=');
        query.push_str(value);
    }
    query
}

fn ensure_rustls_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
            .is_err()
        {
            warn!("could not install rustls ring provider (already installed)");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::{
        build_query_string, parse_positive_decimal, signature_hex, unwrap_envelope, Envelope,
        OrderDraft, Side,
    };

    #[test]
    fn order_draft_serializes_bybit_fields() {
        let draft = OrderDraft::sell_open("10.00".to_string(), "4.9987".to_string(), 0);
        let args = draft.to_args("LPTUSDT");
        assert_eq!(args["category"], "linear");
        assert_eq!(args["symbol"], "LPTUSDT");
        assert_eq!(args["side"], "Sell");
        assert_eq!(args["orderType"], "Limit");
        assert_eq!(args["qty"], "10.00");
        assert_eq!(args["price"], "4.9987");
        assert_eq!(args["timeInForce"], "IOC");
        assert_eq!(args["reduceOnly"], false);
        assert_eq!(args["positionIdx"], 0);
    }

    #[test]
    fn close_draft_is_reduce_only_buy() {
        let draft = OrderDraft::buy_close("10.00".to_string(), "5.0010".to_string(), 2);
        assert_eq!(draft.side, Side::Buy);
        assert!(draft.reduce_only);
        assert_eq!(draft.to_args("LPTUSDT")["positionIdx"], 2);
    }

    #[test]
    fn flipping_position_idx_keeps_rest() {
        let draft = OrderDraft::sell_open("1".to_string(), "2.5".to_string(), 0);
        let flipped = draft.with_position_idx(2);
        assert_eq!(flipped.position_idx, 2);
        assert_eq!(flipped.qty, draft.qty);
        assert_eq!(flipped.price, draft.price);
    }

    #[test]
    fn builds_query_string() {
        assert_eq!(
            build_query_string(&[("category", "linear"), ("symbol", "LPTUSDT")]),
            "category=linear&symbol=LPTUSDT"
        );
        assert_eq!(build_query_string(&[]), "");
    }

    #[test]
    fn signature_is_stable_hex() {
        let sig = signature_hex("secret", "payload").expect("hmac accepts any key");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        let again = signature_hex("secret", "payload").expect("hmac accepts any key");
        assert_eq!(sig, again);
    }

    #[test]
    fn envelope_errors_surface_ret_code() {
        let envelope: Envelope<serde_json::Value> = Envelope {
            ret_code: 10_001,
            ret_msg: "position idx not match position mode".to_string(),
            result: None,
        };
        let error = unwrap_envelope(envelope, "/v5/order/create").expect_err("non-zero retCode");
        assert!(error.to_string().contains("10001"));
    }

    #[test]
    fn parses_positive_filters_only() {
        assert!(parse_positive_decimal("X", "tickSize", "0.0001").is_ok());
        assert!(parse_positive_decimal("X", "tickSize", "0").is_err());
        assert!(parse_positive_decimal("X", "tickSize", "abc").is_err());
    }

    #[test]
    fn sides_round_trip() {
        assert_eq!(Side::from_bybit("Buy"), Some(Side::Buy));
        assert_eq!(Side::from_bybit("Sell"), Some(Side::Sell));
        assert_eq!(Side::from_bybit("None"), None);
        assert_eq!(Side::Sell.as_bybit(), "Sell");
    }
}
