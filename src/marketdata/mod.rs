use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::clock::now_local_ms;
use crate::config::BybitConfig;

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("websocket connection error: {0}")]
    Connection(#[source] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket stream closed")]
    StreamClosed,
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketDataError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(Box::new(error))
    }
}

/// Top-of-book view assembled from the three public topics. `received_ms`
/// is the wall clock of the last update; zero means nothing arrived yet.
#[derive(Debug, Clone, Default)]
pub struct MarketState {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub last_trade: Option<f64>,
    pub last_ticker: Option<f64>,
    pub received_ms: i64,
}

impl MarketState {
    pub fn ready(&self) -> bool {
        self.best_bid.is_some() && self.best_ask.is_some()
    }

    /// Last traded price, falling back to the ticker print.
    pub fn last_price(&self) -> Option<f64> {
        self.last_trade.or(self.last_ticker)
    }
}

type WsSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Public linear stream for one symbol: depth-1 orderbook, trades, tickers.
#[derive(Debug, Clone)]
pub struct PublicStream {
    symbol: String,
    ws_url: String,
    ping_interval_s: u64,
    reconnect_backoff_ms: u64,
}

impl PublicStream {
    pub fn from_config(symbol: impl Into<String>, cfg: &BybitConfig) -> Self {
        Self {
            symbol: symbol.into(),
            ws_url: cfg.public_ws_url.clone(),
            ping_interval_s: cfg.ping_interval_s(),
            reconnect_backoff_ms: cfg.reconnect_backoff_ms(),
        }
    }

    pub fn spawn(self) -> MarketHandle {
        let (tx, rx) = watch::channel(MarketState::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(async move {
            let backoff = Duration::from_millis(self.reconnect_backoff_ms);
            let mut stop_rx = stop_rx;

            loop {
                if *stop_rx.borrow() {
                    break;
                }

                match connect_async(&self.ws_url).await {
                    Ok((socket, _)) => {
                        info!(symbol = %self.symbol, "public stream connected");
                        if let Err(error) = self.run_socket(socket, &tx, &mut stop_rx).await {
                            warn!(error = %error, "public stream dropped");
                        }
                    }
                    Err(error) => {
                        warn!(error = %error, "public stream connect failed");
                    }
                }

                if *stop_rx.borrow() {
                    break;
                }
                time::sleep(backoff).await;
            }
        });

        MarketHandle { rx, stop: stop_tx }
    }

    async fn run_socket(
        &self,
        mut socket: WsSocket,
        tx: &watch::Sender<MarketState>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), MarketDataError> {
        let topics = json!({
            "op": "subscribe",
            "args": [
                format!("orderbook.1.{}", self.symbol),
                format!("publicTrade.{}", self.symbol),
                format!("tickers.{}", self.symbol),
            ],
        });
        socket
            .send(Message::Text(topics.to_string()))
            .await
            .map_err(MarketDataError::from)?;

        let mut ping_interval = time::interval(Duration::from_secs(self.ping_interval_s));
        ping_interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let mut state = tx.borrow().clone();

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    return Ok(());
                }
                _ = ping_interval.tick() => {
                    socket
                        .send(Message::Text(r#"{"op":"ping"}"#.to_string()))
                        .await
                        .map_err(MarketDataError::from)?;
                }
                maybe_msg = socket.next() => {
                    let Some(msg) = maybe_msg else {
                        return Err(MarketDataError::StreamClosed);
                    };
                    let msg = msg.map_err(MarketDataError::from)?;

                    if msg.is_ping() {
                        socket
                            .send(Message::Pong(msg.into_data()))
                            .await
                            .map_err(MarketDataError::from)?;
                        continue;
                    }
                    if msg.is_close() {
                        return Err(MarketDataError::StreamClosed);
                    }
                    if !msg.is_text() {
                        continue;
                    }

                    let Ok(text) = msg.into_text() else { continue };
                    if apply_public_message(&mut state, &text) {
                        state.received_ms = now_local_ms();
                        tx.send_replace(state.clone());
                    }
                }
            }
        }
    }
}

/// Non-blocking view over the stream's latest snapshot.
#[derive(Debug)]
pub struct MarketHandle {
    rx: watch::Receiver<MarketState>,
    stop: watch::Sender<bool>,
}

impl MarketHandle {
    /// Latest snapshot plus its freshness in milliseconds. `i64::MAX` when
    /// nothing has been received yet.
    pub fn snapshot(&self) -> (MarketState, i64) {
        let state = self.rx.borrow().clone();
        let freshness = if state.received_ms > 0 {
            (now_local_ms() - state.received_ms).max(0)
        } else {
            i64::MAX
        };
        (state, freshness)
    }

    pub fn ready(&self) -> bool {
        self.rx.borrow().ready()
    }

    pub fn staleness_ms(&self) -> i64 {
        self.snapshot().1
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

impl crate::orchestrator::MarketFeed for MarketHandle {
    fn snapshot(&self) -> (MarketState, i64) {
        MarketHandle::snapshot(self)
    }
}

#[derive(Debug, Deserialize)]
struct PublicMessage {
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    success: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct OrderbookData {
    #[serde(default)]
    b: Vec<Vec<String>>,
    #[serde(default)]
    a: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TradeData {
    #[serde(default)]
    p: String,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    #[serde(rename = "lastPrice", default)]
    last_price: Option<String>,
}

/// Applies one raw frame to the state. Returns whether anything changed.
fn apply_public_message(state: &mut MarketState, text: &str) -> bool {
    let Ok(msg) = serde_json::from_str::<PublicMessage>(text) else {
        debug!("skipping malformed public frame");
        return false;
    };

    let Some(topic) = msg.topic else {
        if msg.success == Some(false) {
            warn!("public subscription rejected");
        }
        return false;
    };
    let Some(data) = msg.data else {
        return false;
    };

    if topic.starts_with("orderbook.") {
        let Ok(book) = serde_json::from_value::<OrderbookData>(data) else {
            return false;
        };
        let mut changed = false;
        if let Some(bid) = top_level(&book.b) {
            state.best_bid = Some(bid);
            changed = true;
        }
        if let Some(ask) = top_level(&book.a) {
            state.best_ask = Some(ask);
            changed = true;
        }
        changed
    } else if topic.starts_with("publicTrade.") {
        let Ok(trades) = serde_json::from_value::<Vec<TradeData>>(data) else {
            return false;
        };
        let last = trades
            .iter()
            .rev()
            .find_map(|t| t.p.parse::<f64>().ok().filter(|px| *px > 0.0));
        if let Some(px) = last {
            state.last_trade = Some(px);
            true
        } else {
            false
        }
    } else if topic.starts_with("tickers.") {
        let Ok(ticker) = serde_json::from_value::<TickerData>(data) else {
            return false;
        };
        if let Some(px) = ticker
            .last_price
            .as_deref()
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|px| *px > 0.0)
        {
            state.last_ticker = Some(px);
            true
        } else {
            false
        }
    } else {
        false
    }
}

/// First [price, size] level with positive size, parsed.
fn top_level(levels: &[Vec<String>]) -> Option<f64> {
    let level = levels.first()?;
    if level.len() < 2 {
        return None;
    }
    let px = level[0].parse::<f64>().ok().filter(|v| *v > 0.0)?;
    let size = level[1].parse::<f64>().ok()?;
    if size > 0.0 {
        Some(px)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::watch;

    use super::{apply_public_message, MarketHandle, MarketState};

    #[test]
    fn applies_orderbook_frame() {
        let mut state = MarketState::default();
        let frame = r#"{"topic":"orderbook.1.LPTUSDT","type":"snapshot","data":{"b":[["4.9990","120.5"]],"a":[["5.0001","80.0"]]}}"#;
        assert!(apply_public_message(&mut state, frame));
        assert_eq!(state.best_bid, Some(4.9990));
        assert_eq!(state.best_ask, Some(5.0001));
        assert!(state.ready());
    }

    #[test]
    fn ignores_zero_size_levels() {
        let mut state = MarketState::default();
        let frame = r#"{"topic":"orderbook.1.LPTUSDT","type":"delta","data":{"b":[["4.9990","0"]],"a":[]}}"#;
        assert!(!apply_public_message(&mut state, frame));
        assert_eq!(state.best_bid, None);
    }

    #[test]
    fn applies_trade_frame_takes_last_print() {
        let mut state = MarketState::default();
        let frame = r#"{"topic":"publicTrade.LPTUSDT","data":[{"p":"4.9985","S":"Sell"},{"p":"4.9991","S":"Buy"}]}"#;
        assert!(apply_public_message(&mut state, frame));
        assert_eq!(state.last_trade, Some(4.9991));
    }

    #[test]
    fn applies_ticker_frame() {
        let mut state = MarketState::default();
        let frame = r#"{"topic":"tickers.LPTUSDT","data":{"lastPrice":"5.0002"}}"#;
        assert!(apply_public_message(&mut state, frame));
        assert_eq!(state.last_ticker, Some(5.0002));
        assert_eq!(state.last_price(), Some(5.0002));
    }

    #[test]
    fn ignores_acks_and_garbage() {
        let mut state = MarketState::default();
        assert!(!apply_public_message(&mut state, r#"{"op":"pong"}"#));
        assert!(!apply_public_message(
            &mut state,
            r#"{"success":true,"op":"subscribe"}"#
        ));
        assert!(!apply_public_message(&mut state, "not json"));
    }

    #[test]
    fn trade_print_wins_over_ticker_for_last_price() {
        let mut state = MarketState::default();
        apply_public_message(
            &mut state,
            r#"{"topic":"tickers.LPTUSDT","data":{"lastPrice":"5.0002"}}"#,
        );
        apply_public_message(
            &mut state,
            r#"{"topic":"publicTrade.LPTUSDT","data":[{"p":"4.9991"}]}"#,
        );
        assert_eq!(state.last_price(), Some(4.9991));
    }

    #[test]
    fn stop_is_idempotent() {
        let (tx, rx) = watch::channel(MarketState::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = MarketHandle { rx, stop: stop_tx };
        handle.stop();
        handle.stop();
        assert!(*stop_rx.borrow());
        drop(tx);
    }

    #[test]
    fn empty_snapshot_is_infinitely_stale() {
        let (tx, rx) = watch::channel(MarketState::default());
        let (stop_tx, _stop_rx) = watch::channel(false);
        let handle = MarketHandle { rx, stop: stop_tx };
        let (state, freshness) = handle.snapshot();
        assert!(!state.ready());
        assert_eq!(freshness, i64::MAX);
        drop(tx);
    }
}
