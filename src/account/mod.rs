use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::time;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::clock::now_local_ms;
use crate::config::{BybitConfig, Credentials};
use crate::exchange::{ws_login_signature, ExecutionRecord, Side};

const AUTH_TIMEOUT_MS: u64 = 5_000;
const AUTH_EXPIRES_SLACK_MS: i64 = 20_000;
const EXEC_RING_CAP: usize = 512;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("websocket connection error: {0}")]
    Connection(#[source] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("authentication timed out")]
    AuthTimeout,
    #[error("signature error: {0}")]
    Signature(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(Box::new(error))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out waiting for final order state")]
    TimedOut,
    #[error("stream stopped before a final order state arrived")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal Bybit order statuses; everything else is still working.
    pub fn from_bybit_terminal(raw: &str) -> Option<Self> {
        match raw {
            "Filled" => Some(Self::Filled),
            "PartiallyFilledCanceled" => Some(Self::PartiallyFilled),
            "Cancelled" | "Canceled" => Some(Self::Cancelled),
            "Rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderFinal {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_price: Option<f64>,
}

type PositionKey = (String, u8, Side);

#[derive(Debug, Clone, Copy)]
struct PositionEntry {
    seq: u64,
    qty: f64,
}

/// Caches fed by the private stream. One short-held lock guards them all;
/// no await happens under it.
#[derive(Default)]
struct AccountState {
    finals: HashMap<String, OrderFinal>,
    waiters: HashMap<String, Vec<oneshot::Sender<OrderFinal>>>,
    positions: HashMap<PositionKey, PositionEntry>,
    executions: VecDeque<ExecutionRecord>,
    stopped: bool,
}

enum Registration {
    Ready(OrderFinal),
    Pending(oneshot::Receiver<OrderFinal>),
    Stopped,
}

impl AccountState {
    fn register_waiter(&mut self, order_id: &str) -> Registration {
        if let Some(found) = self.finals.get(order_id) {
            return Registration::Ready(found.clone());
        }
        if self.stopped {
            return Registration::Stopped;
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(order_id.to_string()).or_default().push(tx);
        Registration::Pending(rx)
    }

    fn record_final(&mut self, terminal: OrderFinal) {
        if let Some(waiters) = self.waiters.remove(&terminal.order_id) {
            for waiter in waiters {
                let _ = waiter.send(terminal.clone());
            }
        }
        self.finals.insert(terminal.order_id.clone(), terminal);
    }

    fn record_position(&mut self, symbol: &str, position_idx: u8, side: &str, seq: u64, qty: f64) {
        let keys: &[Side] = match Side::from_bybit(side) {
            Some(Side::Buy) => &[Side::Buy],
            Some(Side::Sell) => &[Side::Sell],
            // A flat position event carries no side; it clears both legs.
            None => &[Side::Buy, Side::Sell],
        };
        for key_side in keys {
            let key = (symbol.to_string(), position_idx, *key_side);
            match self.positions.get(&key) {
                Some(existing) if existing.seq > seq => {}
                _ => {
                    self.positions.insert(key, PositionEntry { seq, qty });
                }
            }
        }
    }

    fn record_execution(&mut self, record: ExecutionRecord) {
        if self.executions.len() == EXEC_RING_CAP {
            self.executions.pop_front();
        }
        self.executions.push_back(record);
    }

    fn position_size(&self, symbol: &str, position_idx: u8, side: Side) -> Option<f64> {
        self.positions
            .get(&(symbol.to_string(), position_idx, side))
            .map(|entry| entry.qty)
    }

    fn executions_in_window(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Vec<ExecutionRecord> {
        self.executions
            .iter()
            .filter(|r| r.symbol == symbol)
            .filter(|r| r.exec_time_ms >= start_ms && r.exec_time_ms <= end_ms)
            .cloned()
            .collect()
    }

    fn drain_waiters(&mut self) {
        self.stopped = true;
        // Dropping the senders resolves every pending waiter as cancelled.
        self.waiters.clear();
    }
}

/// Authenticated private stream: order, execution and position topics.
#[derive(Debug, Clone)]
pub struct PrivateStream {
    url: String,
    api_key: String,
    api_secret: String,
    ping_interval_s: u64,
}

impl PrivateStream {
    pub fn from_config(cfg: &BybitConfig, creds: &Credentials) -> Self {
        Self {
            url: cfg.private_ws_url.clone(),
            api_key: creds.api_key.clone(),
            api_secret: creds.api_secret.clone(),
            ping_interval_s: cfg.ping_interval_s(),
        }
    }

    pub async fn connect(self) -> Result<AccountHandle, StreamError> {
        let (mut socket, _) = connect_async(&self.url).await?;

        let expires = now_local_ms() + AUTH_EXPIRES_SLACK_MS;
        let signature = ws_login_signature(&self.api_secret, expires)
            .map_err(|e| StreamError::Signature(e.to_string()))?;
        let auth = json!({
            "op": "auth",
            "args": [self.api_key, expires.to_string(), signature],
        });
        socket.send(Message::Text(auth.to_string())).await?;
        wait_auth_ack(&mut socket).await?;

        let subscribe = json!({
            "op": "subscribe",
            "args": ["order", "execution", "position"],
        });
        socket.send(Message::Text(subscribe.to_string())).await?;
        info!("private stream ready (authed + subscribed)");

        let state = Arc::new(Mutex::new(AccountState::default()));
        let last_msg_ms = Arc::new(AtomicI64::new(now_local_ms()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = AccountHandle {
            state: Arc::clone(&state),
            last_msg_ms: Arc::clone(&last_msg_ms),
            stop: stop_tx,
        };

        let ping_interval_s = self.ping_interval_s;
        tokio::spawn(async move {
            let mut stop_rx = stop_rx;
            if let Err(error) =
                reader_loop(socket, &state, &last_msg_ms, &mut stop_rx, ping_interval_s).await
            {
                warn!(error = %error, "private stream reader exited");
            }
            if let Ok(mut guard) = state.lock() {
                guard.drain_waiters();
            }
        });

        Ok(handle)
    }
}

async fn wait_auth_ack(socket: &mut WsSocket) -> Result<(), StreamError> {
    let deadline = time::Instant::now() + Duration::from_millis(AUTH_TIMEOUT_MS);

    loop {
        let remaining = deadline.saturating_duration_since(time::Instant::now());
        if remaining.is_zero() {
            return Err(StreamError::AuthTimeout);
        }

        let maybe_msg = time::timeout(remaining, socket.next())
            .await
            .map_err(|_| StreamError::AuthTimeout)?;
        let Some(msg) = maybe_msg else {
            return Err(StreamError::Auth("connection closed during auth".into()));
        };
        let msg = msg.map_err(StreamError::from)?;
        if !msg.is_text() {
            continue;
        }
        let Ok(text) = msg.into_text() else { continue };
        let Ok(ack) = serde_json::from_str::<OpAck>(&text) else {
            continue;
        };
        if ack.op.as_deref() == Some("auth") {
            // Stream WS acks with success=true, trade-style with retCode=0.
            if ack.success == Some(true) || ack.ret_code == Some(0) {
                return Ok(());
            }
            return Err(StreamError::Auth(text));
        }
    }
}

type WsSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn reader_loop(
    mut socket: WsSocket,
    state: &Arc<Mutex<AccountState>>,
    last_msg_ms: &AtomicI64,
    stop_rx: &mut watch::Receiver<bool>,
    ping_interval_s: u64,
) -> Result<(), StreamError> {
    let mut ping_interval = time::interval(Duration::from_secs(ping_interval_s));
    ping_interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                return Ok(());
            }
            _ = ping_interval.tick() => {
                socket
                    .send(Message::Text(r#"{"op":"ping"}"#.to_string()))
                    .await
                    .map_err(StreamError::from)?;
            }
            maybe_msg = socket.next() => {
                let Some(msg) = maybe_msg else {
                    return Err(StreamError::Connection(Box::new(
                        tokio_tungstenite::tungstenite::Error::ConnectionClosed,
                    )));
                };
                let msg = msg.map_err(StreamError::from)?;

                if msg.is_ping() {
                    socket
                        .send(Message::Pong(msg.into_data()))
                        .await
                        .map_err(StreamError::from)?;
                    continue;
                }
                if msg.is_close() {
                    return Err(StreamError::Connection(Box::new(
                        tokio_tungstenite::tungstenite::Error::ConnectionClosed,
                    )));
                }
                if !msg.is_text() {
                    continue;
                }

                last_msg_ms.store(now_local_ms(), Ordering::Relaxed);
                let Ok(text) = msg.into_text() else { continue };
                if let Ok(mut guard) = state.lock() {
                    apply_private_message(&mut guard, &text);
                }
            }
        }
    }
}

/// Cache reads and synchronised waits over the private stream.
pub struct AccountHandle {
    state: Arc<Mutex<AccountState>>,
    last_msg_ms: Arc<AtomicI64>,
    stop: watch::Sender<bool>,
}

impl AccountHandle {
    /// Resolves with the terminal state of the order. A terminal event that
    /// arrived before this call resolves immediately; registration and
    /// arrival cannot race past each other because both go through the same
    /// lock.
    pub async fn wait_final(
        &self,
        order_id: &str,
        timeout_ms: u64,
    ) -> Result<OrderFinal, WaitError> {
        let registration = {
            let mut guard = self.state.lock().map_err(|_| WaitError::Cancelled)?;
            guard.register_waiter(order_id)
        };

        let rx = match registration {
            Registration::Ready(found) => return Ok(found),
            Registration::Stopped => return Err(WaitError::Cancelled),
            Registration::Pending(rx) => rx,
        };

        match time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(terminal)) => Ok(terminal),
            Ok(Err(_)) => Err(WaitError::Cancelled),
            Err(_) => Err(WaitError::TimedOut),
        }
    }

    /// Pure cache read. `None` means the stream has not reported this key,
    /// which is different from a flat position.
    pub fn position_size(&self, symbol: &str, position_idx: u8, side: Side) -> Option<f64> {
        let guard = self.state.lock().ok()?;
        guard.position_size(symbol, position_idx, side)
    }

    /// Pure cache read, inclusive bounds. Empty output is a valid answer.
    pub fn executions_in_window(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Vec<ExecutionRecord> {
        match self.state.lock() {
            Ok(guard) => guard.executions_in_window(symbol, start_ms, end_ms),
            Err(_) => Vec::new(),
        }
    }

    /// Wall-clock milliseconds since any message arrived.
    pub fn staleness_ms(&self) -> i64 {
        (now_local_ms() - self.last_msg_ms.load(Ordering::Relaxed)).max(0)
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
        if let Ok(mut guard) = self.state.lock() {
            guard.drain_waiters();
        }
    }
}

impl crate::orchestrator::AccountStream for AccountHandle {
    async fn wait_final(&self, order_id: &str, timeout_ms: u64) -> Result<OrderFinal, WaitError> {
        AccountHandle::wait_final(self, order_id, timeout_ms).await
    }

    fn position_size(&self, symbol: &str, position_idx: u8, side: Side) -> Option<f64> {
        AccountHandle::position_size(self, symbol, position_idx, side)
    }

    fn executions_in_window(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Vec<ExecutionRecord> {
        AccountHandle::executions_in_window(self, symbol, start_ms, end_ms)
    }

    fn staleness_ms(&self) -> i64 {
        AccountHandle::staleness_ms(self)
    }
}

#[derive(Debug, Deserialize)]
struct OpAck {
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(rename = "retCode", default)]
    ret_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TopicMessage {
    #[serde(default)]
    topic: Option<String>,
    #[serde(default = "Vec::new")]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OrderItem {
    #[serde(rename = "orderId", default)]
    order_id: String,
    #[serde(rename = "orderStatus", default)]
    order_status: String,
    #[serde(rename = "cumExecQty", default)]
    cum_exec_qty: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
}

#[derive(Debug, Deserialize)]
struct ExecItem {
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
struct PositionItemWs {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    size: String,
    #[serde(rename = "positionIdx", default)]
    position_idx: u8,
    #[serde(default)]
    seq: u64,
}

fn apply_private_message(state: &mut AccountState, text: &str) {
    let Ok(msg) = serde_json::from_str::<TopicMessage>(text) else {
        return;
    };
    let Some(topic) = msg.topic.as_deref() else {
        return;
    };

    match topic {
        "order" => {
            for item in msg.data {
                let Ok(order) = serde_json::from_value::<OrderItem>(item) else {
                    continue;
                };
                apply_order_item(state, &order);
            }
        }
        "execution" => {
            for item in msg.data {
                let Ok(exec) = serde_json::from_value::<ExecItem>(item) else {
                    continue;
                };
                apply_exec_item(state, &exec);
            }
        }
        "position" => {
            for item in msg.data {
                let Ok(position) = serde_json::from_value::<PositionItemWs>(item) else {
                    continue;
                };
                state.record_position(
                    &position.symbol,
                    position.position_idx,
                    &position.side,
                    position.seq,
                    position.size.parse::<f64>().unwrap_or(0.0),
                );
            }
        }
        _ => {}
    }
}

fn apply_order_item(state: &mut AccountState, order: &OrderItem) {
    if order.order_id.is_empty() {
        return;
    }
    let Some(status) = OrderStatus::from_bybit_terminal(&order.order_status) else {
        return;
    };

    let filled_qty = order.cum_exec_qty.parse::<f64>().unwrap_or(0.0);
    let avg_price = order
        .avg_price
        .parse::<f64>()
        .ok()
        .filter(|px| *px > 0.0);

    state.record_final(OrderFinal {
        order_id: order.order_id.clone(),
        status,
        filled_qty,
        avg_price,
    });
}

fn apply_exec_item(state: &mut AccountState, exec: &ExecItem) {
    let Some(side) = Side::from_bybit(&exec.side) else {
        return;
    };
    let qty = exec.exec_qty.parse::<f64>().unwrap_or(0.0);
    let price = exec.exec_price.parse::<f64>().unwrap_or(0.0);
    if qty <= 0.0 || price <= 0.0 {
        return;
    }

    state.record_execution(ExecutionRecord {
        symbol: exec.symbol.clone(),
        order_id: exec.order_id.clone(),
        side,
        qty,
        price,
        exec_time_ms: exec.exec_time.parse::<i64>().unwrap_or(0),
        fee_usdt: exec.exec_fee.parse::<f64>().unwrap_or(0.0).abs(),
    });
}
