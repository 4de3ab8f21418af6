use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::time;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::clock::now_local_ms;
use crate::config::{BybitConfig, Credentials};
use crate::exchange::{ws_login_signature, OrderDraft};

const AUTH_TIMEOUT_MS: u64 = 5_000;
const AUTH_EXPIRES_SLACK_MS: i64 = 10_000;
const REFERER: &str = "funbot";

// Bybit rejects an order whose positionIdx disagrees with the account's
// one-way/hedge mode with this code; the retry flips 0 <-> 2 once.
const RET_PARAM_ERROR: i64 = 10_001;
const POSITION_IDX_MISMATCH_HINT: &str = "position idx not match";

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("order acknowledgement timed out")]
    Timeout,
    #[error("trade channel closed before the acknowledgement arrived")]
    Closed,
    #[error("trade channel transport error: {0}")]
    Transport(String),
    #[error("order rejected (retCode={ret_code}): {msg}")]
    Rejected { ret_code: i64, msg: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("authentication timed out")]
    AuthTimeout,
    #[error("signature error: {0}")]
    Signature(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TradeError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

pub fn flip_position_idx(position_idx: u8) -> u8 {
    if position_idx == 0 {
        2
    } else {
        0
    }
}

pub fn is_position_idx_mismatch(error: &TradeError) -> bool {
    matches!(
        error,
        TradeError::Rejected { ret_code, msg }
            if *ret_code == RET_PARAM_ERROR
                && msg.to_lowercase().contains(POSITION_IDX_MISMATCH_HINT)
    )
}

/// Submits the draft, retrying exactly once with the flipped position index
/// when the exchange reports the idx/account-mode mismatch. Every other
/// outcome is surfaced verbatim.
pub async fn create_with_idx_retry<F, Fut>(
    draft: &OrderDraft,
    mut submit: F,
) -> Result<String, TradeError>
where
    F: FnMut(OrderDraft) -> Fut,
    Fut: Future<Output = Result<String, TradeError>>,
{
    let first = submit(draft.clone()).await;
    match first {
        Err(error) if is_position_idx_mismatch(&error) => {
            let flipped = flip_position_idx(draft.position_idx);
            warn!(
                from = draft.position_idx,
                to = flipped,
                "position idx mismatch; retrying once"
            );
            submit(draft.with_position_idx(flipped)).await
        }
        other => other,
    }
}

#[derive(Debug)]
struct TradeReply {
    ret_code: i64,
    ret_msg: String,
    order_id: Option<String>,
}

type PendingMap = HashMap<String, oneshot::Sender<TradeReply>>;
type WsSink = SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsStream = SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Order-creation channel over the trade websocket. One request, one reply,
/// matched by `reqId`.
#[derive(Debug, Clone)]
pub struct TradeWs {
    url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    ping_interval_s: u64,
}

impl TradeWs {
    pub fn from_config(cfg: &BybitConfig, creds: &Credentials) -> Self {
        Self {
            url: cfg.trade_ws_url.clone(),
            api_key: creds.api_key.clone(),
            api_secret: creds.api_secret.clone(),
            recv_window_ms: cfg.recv_window_ms(),
            ping_interval_s: cfg.ping_interval_s(),
        }
    }

    pub async fn connect(self) -> Result<TradeHandle, TradeError> {
        let (mut socket, _) = connect_async(&self.url).await?;

        let expires = now_local_ms() + AUTH_EXPIRES_SLACK_MS;
        let signature = ws_login_signature(&self.api_secret, expires)
            .map_err(|e| TradeError::Signature(e.to_string()))?;
        let auth = json!({
            "op": "auth",
            "args": [self.api_key, expires.to_string(), signature],
        });
        socket.send(Message::Text(auth.to_string())).await?;
        wait_auth_ack(&mut socket).await?;
        info!("trade channel ready (authed)");

        let (sink, stream) = socket.split();
        let writer = Arc::new(AsyncMutex::new(sink));
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = TradeHandle {
            writer: Arc::clone(&writer),
            pending: Arc::clone(&pending),
            next_req_id: Arc::new(AtomicU64::new(1)),
            recv_window_ms: self.recv_window_ms,
            stop: stop_tx,
        };

        let ping_interval_s = self.ping_interval_s;
        tokio::spawn(async move {
            let mut stop_rx = stop_rx;
            if let Err(error) =
                reader_loop(stream, &writer, &pending, &mut stop_rx, ping_interval_s).await
            {
                warn!(error = %error, "trade channel reader exited");
            }
            // Dropping the senders resolves every pending request as closed.
            if let Ok(mut guard) = pending.lock() {
                guard.clear();
            }
        });

        Ok(handle)
    }
}

async fn wait_auth_ack(
    socket: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Result<(), TradeError> {
    let deadline = time::Instant::now() + Duration::from_millis(AUTH_TIMEOUT_MS);

    loop {
        let remaining = deadline.saturating_duration_since(time::Instant::now());
        if remaining.is_zero() {
            return Err(TradeError::AuthTimeout);
        }

        let maybe_msg = time::timeout(remaining, socket.next())
            .await
            .map_err(|_| TradeError::AuthTimeout)?;
        let Some(msg) = maybe_msg else {
            return Err(TradeError::Auth("connection closed during auth".into()));
        };
        let msg = msg.map_err(TradeError::from)?;
        if !msg.is_text() {
            continue;
        }
        let Ok(text) = msg.into_text() else { continue };
        let Ok(ack) = serde_json::from_str::<AuthAck>(&text) else {
            continue;
        };
        if ack.op.as_deref() == Some("auth") {
            if ack.ret_code == Some(0) {
                return Ok(());
            }
            return Err(TradeError::Auth(text));
        }
    }
}

async fn reader_loop(
    mut stream: WsStream,
    writer: &Arc<AsyncMutex<WsSink>>,
    pending: &Arc<Mutex<PendingMap>>,
    stop_rx: &mut watch::Receiver<bool>,
    ping_interval_s: u64,
) -> Result<(), TradeError> {
    let mut ping_interval = time::interval(Duration::from_secs(ping_interval_s));
    ping_interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                return Ok(());
            }
            _ = ping_interval.tick() => {
                let mut sink = writer.lock().await;
                sink.send(Message::Text(r#"{"op":"ping"}"#.to_string()))
                    .await
                    .map_err(TradeError::from)?;
            }
            maybe_msg = stream.next() => {
                let Some(msg) = maybe_msg else {
                    return Err(TradeError::Closed);
                };
                let msg = msg.map_err(TradeError::from)?;

                if msg.is_ping() {
                    let mut sink = writer.lock().await;
                    sink.send(Message::Pong(msg.into_data()))
                        .await
                        .map_err(TradeError::from)?;
                    continue;
                }
                if msg.is_close() {
                    return Err(TradeError::Closed);
                }
                if !msg.is_text() {
                    continue;
                }

                let Ok(text) = msg.into_text() else { continue };
                route_reply(pending, &text);
            }
        }
    }
}

fn route_reply(pending: &Arc<Mutex<PendingMap>>, text: &str) {
    let Ok(raw) = serde_json::from_str::<TradeReplyRaw>(text) else {
        return;
    };
    let Some(req_id) = raw.req_id else {
        return;
    };

    let waiter = match pending.lock() {
        Ok(mut guard) => guard.remove(&req_id),
        Err(_) => None,
    };
    if let Some(waiter) = waiter {
        let _ = waiter.send(TradeReply {
            ret_code: raw.ret_code.unwrap_or(-1),
            ret_msg: raw.ret_msg,
            order_id: raw.data.and_then(|d| d.order_id),
        });
    }
}

pub struct TradeHandle {
    writer: Arc<AsyncMutex<WsSink>>,
    pending: Arc<Mutex<PendingMap>>,
    next_req_id: Arc<AtomicU64>,
    recv_window_ms: u64,
    stop: watch::Sender<bool>,
}

impl TradeHandle {
    /// Sends `order.create` and waits for the correlated acknowledgement.
    /// A timeout here does NOT mean the order died server-side; the caller
    /// must reconcile through the account stream.
    pub async fn create_order(
        &self,
        symbol: &str,
        draft: &OrderDraft,
        server_ts_ms: i64,
        timeout_ms: u64,
    ) -> Result<String, TradeError> {
        create_with_idx_retry(draft, |attempt| {
            self.submit_once(symbol, attempt, server_ts_ms, timeout_ms)
        })
        .await
    }

    async fn submit_once(
        &self,
        symbol: &str,
        draft: OrderDraft,
        server_ts_ms: i64,
        timeout_ms: u64,
    ) -> Result<String, TradeError> {
        let req_id = format!("fun-{}", self.next_req_id.fetch_add(1, Ordering::Relaxed));
        let request = json!({
            "reqId": req_id,
            "header": {
                "X-BAPI-TIMESTAMP": server_ts_ms.to_string(),
                "X-BAPI-RECV-WINDOW": self.recv_window_ms.to_string(),
                "Referer": REFERER,
            },
            "op": "order.create",
            "args": [draft.to_args(symbol)],
        });

        let (tx, rx) = oneshot::channel();
        if let Ok(mut guard) = self.pending.lock() {
            guard.insert(req_id.clone(), tx);
        } else {
            return Err(TradeError::Closed);
        }

        {
            let mut sink = self.writer.lock().await;
            if let Err(error) = sink.send(Message::Text(request.to_string())).await {
                self.forget(&req_id);
                return Err(TradeError::Transport(error.to_string()));
            }
        }

        match time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(reply)) => {
                if reply.ret_code == 0 {
                    reply
                        .order_id
                        .ok_or_else(|| TradeError::Transport("ack missing orderId".to_string()))
                } else {
                    Err(TradeError::Rejected {
                        ret_code: reply.ret_code,
                        msg: reply.ret_msg,
                    })
                }
            }
            Ok(Err(_)) => Err(TradeError::Closed),
            Err(_) => {
                self.forget(&req_id);
                Err(TradeError::Timeout)
            }
        }
    }

    fn forget(&self, req_id: &str) {
        if let Ok(mut guard) = self.pending.lock() {
            guard.remove(req_id);
        }
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
        if let Ok(mut guard) = self.pending.lock() {
            guard.clear();
        }
    }
}

impl crate::orchestrator::TradeChannel for TradeHandle {
    async fn create_order(
        &self,
        symbol: &str,
        draft: &OrderDraft,
        server_ts_ms: i64,
        timeout_ms: u64,
    ) -> Result<String, TradeError> {
        TradeHandle::create_order(self, symbol, draft, server_ts_ms, timeout_ms).await
    }
}

#[derive(Debug, Deserialize)]
struct AuthAck {
    #[serde(default)]
    op: Option<String>,
    #[serde(rename = "retCode", default)]
    ret_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TradeReplyRaw {
    #[serde(rename = "reqId", default)]
    req_id: Option<String>,
    #[serde(rename = "retCode", default)]
    ret_code: Option<i64>,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    data: Option<TradeReplyData>,
}

#[derive(Debug, Deserialize)]
struct TradeReplyData {
    #[serde(rename = "orderId", default)]
    order_id: Option<String>,
}
