//! WebSocket transport for the CLOB market channel.
//!
//! One `WsConnection` owns the socket; its owner (normally the orderbook
//! manager) drives `next_event` and decides on reconnects. The transport
//! remembers no topics: after a reconnect the owner must resubscribe.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::{
    errors::{WsClientError, WsResult},
    orderbook::PriceLevel,
    types::TokenId,
};
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ExponentialBackoff {
    /// Next delay in the 1, 2, 4, 8, 16, 30, 30… schedule.
    pub fn advance(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    pub ping_interval: Duration,
    pub auto_reconnect: bool,
    pub backoff: ExponentialBackoff,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            ping_interval: Duration::from_secs(10),
            auto_reconnect: true,
            backoff: ExponentialBackoff::default(),
        }
    }
}

/// Connection lifecycle. Transitions are monotonic within one session;
/// `Reconnecting` loops back through `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WsState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Closing = 4,
    Closed = 5,
}

/// Shared atomic cell so any thread can observe the latest state.
#[derive(Debug, Clone, Default)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn get(&self) -> WsState {
        match self.0.load(Ordering::Acquire) {
            1 => WsState::Connecting,
            2 => WsState::Connected,
            3 => WsState::Reconnecting,
            4 => WsState::Closing,
            5 => WsState::Closed,
            _ => WsState::Disconnected,
        }
    }

    pub(crate) fn set(&self, state: WsState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Frame counters, shared so the owner can read them from any thread.
#[derive(Debug, Default)]
pub struct TransportStats {
    messages: AtomicU64,
    bytes: AtomicU64,
}

impl TransportStats {
    pub fn messages_received(&self) -> u64 {
        self.messages.load(Ordering::Acquire)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    fn record(&self, bytes: usize) {
        self.messages.fetch_add(1, Ordering::Release);
        self.bytes.fetch_add(bytes as u64, Ordering::Release);
    }
}

/// Dialer for the market channel.
#[derive(Debug, Clone)]
pub struct WsClient {
    config: WsConfig,
    url: Url,
    state: StateCell,
    stats: Arc<TransportStats>,
}

impl WsClient {
    pub fn new(config: WsConfig) -> WsResult<Self> {
        let url = normalize_ws_url(&config.url)?;
        Ok(Self {
            config,
            url,
            state: StateCell::default(),
            stats: Arc::new(TransportStats::default()),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> WsState {
        self.state.get()
    }

    pub fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        self.stats.clone()
    }

    pub async fn connect(&self) -> WsResult<WsConnection> {
        self.state.set(WsState::Connecting);
        match connect_async(self.url.as_str()).await {
            Ok((stream, _)) => {
                self.state.set(WsState::Connected);
                tracing::info!(url = %self.url, "websocket connected");
                Ok(WsConnection {
                    url: self.url.clone(),
                    stream,
                    state: self.state.clone(),
                    stats: self.stats.clone(),
                    backoff: self.config.backoff.clone(),
                    pending: VecDeque::new(),
                    last_pong: Instant::now(),
                    generation: 0,
                })
            }
            Err(err) => {
                self.state.set(WsState::Disconnected);
                Err(err.into())
            }
        }
    }
}

/// Live connection. All reads and writes happen on the owning task.
#[derive(Debug)]
pub struct WsConnection {
    url: Url,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    state: StateCell,
    stats: Arc<TransportStats>,
    backoff: ExponentialBackoff,
    pending: VecDeque<WsEvent>,
    last_pong: Instant,
    generation: u64,
}

impl WsConnection {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> WsState {
        self.state.get()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Next parsed event. `Ok(None)` means the server ended the stream.
    ///
    /// The initial subscription response is an array of book snapshots; it is
    /// split into individual `Book` events delivered one per call.
    pub async fn next_event(&mut self) -> WsResult<Option<WsEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.stats.record(text.len());
                    self.ingest(&text);
                }
                Some(Ok(Message::Binary(binary))) => {
                    self.stats.record(binary.len());
                    let text = String::from_utf8(binary).map_err(|_| {
                        WsClientError::InvalidMessage("invalid utf8 payload".to_string())
                    })?;
                    self.ingest(&text);
                }
                Some(Ok(Message::Ping(payload))) => {
                    self.stream.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Pong(_))) => {
                    self.last_pong = Instant::now();
                    return Ok(Some(WsEvent::Pong));
                }
                Some(Ok(Message::Close(frame))) => {
                    let info = frame.map(|frame| CloseFrameInfo {
                        code: u16::from(frame.code),
                        reason: frame.reason.into_owned(),
                    });
                    return Ok(Some(WsEvent::Closed(info)));
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(None),
            }
        }
    }

    /// Sends a raw text frame. Fails unless the connection is `Connected`.
    pub async fn send_text(&mut self, text: String) -> WsResult<()> {
        if self.state.get() != WsState::Connected {
            return Err(WsClientError::NotConnected);
        }
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    pub async fn subscribe_assets(&mut self, assets: &[TokenId]) -> WsResult<()> {
        if assets.is_empty() {
            return Err(WsClientError::EmptySubscriptions);
        }
        self.send_text(subscribe_frame(assets)).await
    }

    pub async fn unsubscribe_assets(&mut self, assets: &[TokenId]) -> WsResult<()> {
        if assets.is_empty() {
            return Err(WsClientError::EmptySubscriptions);
        }
        self.send_text(unsubscribe_frame(assets)).await
    }

    /// Protocol-level keepalive ping.
    pub async fn ping(&mut self) -> WsResult<()> {
        self.stream.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    /// True when no pong arrived within `window` (the owner closes with
    /// reason "stale" after two missed intervals).
    pub fn pong_overdue(&self, window: Duration) -> bool {
        self.last_pong.elapsed() > window
    }

    /// Redials with exponential backoff and ±10% jitter. Parsed-but-unread
    /// events from the old session are dropped; the caller resubscribes.
    pub async fn reconnect(&mut self, max_attempts: Option<u32>) -> WsResult<()> {
        use rand::Rng;

        self.state.set(WsState::Reconnecting);
        let mut delay = self.backoff.initial;
        let mut attempts = 0u32;

        loop {
            if let Some(max) = max_attempts {
                if attempts >= max {
                    self.state.set(WsState::Disconnected);
                    return Err(WsClientError::InvalidMessage(format!(
                        "max reconnection attempts ({max}) exceeded"
                    )));
                }
            }
            attempts += 1;

            let jitter = rand::thread_rng().gen_range(0.9..1.1);
            let actual_delay = delay.mul_f64(jitter);
            tracing::warn!(attempts, ?actual_delay, url = %self.url, "reconnecting");
            tokio::time::sleep(actual_delay).await;

            self.state.set(WsState::Connecting);
            match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    self.stream = stream;
                    self.generation = self.generation.wrapping_add(1);
                    self.pending.clear();
                    self.last_pong = Instant::now();
                    self.state.set(WsState::Connected);
                    tracing::info!(attempts, generation = self.generation, "reconnected");
                    return Ok(());
                }
                Err(err) => {
                    tracing::error!(attempts, error = %err, "reconnect attempt failed");
                    self.state.set(WsState::Reconnecting);
                    delay = self.backoff.advance(delay);
                }
            }
        }
    }

    /// Graceful shutdown: `Closing` → `Closed`.
    pub async fn close(&mut self) -> WsResult<()> {
        self.state.set(WsState::Closing);
        let result = self.stream.close(None).await;
        self.state.set(WsState::Closed);
        result.map_err(Into::into)
    }

    fn ingest(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "unparseable websocket frame");
                self.pending.push_back(WsEvent::Unknown(text.to_string()));
                return;
            }
        };
        match value {
            Value::Array(items) => {
                for item in items {
                    self.pending.push_back(classify(item));
                }
            }
            other => self.pending.push_back(classify(other)),
        }
    }
}

/// Delta-subscribe frame for the market channel.
pub fn subscribe_frame(assets: &[TokenId]) -> String {
    json!({
        "type": "market",
        "assets_ids": assets.iter().map(TokenId::as_str).collect::<Vec<_>>(),
    })
    .to_string()
}

pub fn unsubscribe_frame(assets: &[TokenId]) -> String {
    json!({
        "type": "market",
        "assets_ids": assets.iter().map(TokenId::as_str).collect::<Vec<_>>(),
        "action": "unsubscribe",
    })
    .to_string()
}

/// Parses one text frame into events (arrays fan out to one event each).
pub fn parse_frames(text: &str) -> Vec<WsEvent> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => items.into_iter().map(classify).collect(),
        Ok(other) => vec![classify(other)],
        Err(_) => vec![WsEvent::Unknown(text.to_string())],
    }
}

fn classify(value: Value) -> WsEvent {
    let Some(event_type) = value
        .get("event_type")
        .and_then(Value::as_str)
        .map(str::to_owned)
    else {
        return WsEvent::Unknown(value.to_string());
    };
    match event_type.as_str() {
        "book" => decode(value, WsEvent::Book),
        "price_change" => decode(value, WsEvent::PriceChange),
        "tick_size_change" => decode(value, WsEvent::TickSizeChange),
        "last_trade_price" => decode(value, WsEvent::LastTrade),
        _ => WsEvent::Unknown(value.to_string()),
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, wrap: fn(T) -> WsEvent) -> WsEvent {
    let raw = value.to_string();
    match serde_json::from_value::<T>(value) {
        Ok(message) => wrap(message),
        Err(err) => {
            tracing::warn!(error = %err, "malformed market message");
            WsEvent::Unknown(raw)
        }
    }
}

fn normalize_ws_url(raw: &str) -> WsResult<Url> {
    if raw.is_empty() {
        return Err(WsClientError::InvalidMessage(
            "websocket url not configured".to_string(),
        ));
    }
    let mut candidate = raw.to_string();
    if candidate.starts_with("https://") {
        candidate = candidate.replacen("https://", "wss://", 1);
    } else if candidate.starts_with("http://") {
        candidate = candidate.replacen("http://", "ws://", 1);
    } else if !candidate.starts_with("ws://") && !candidate.starts_with("wss://") {
        candidate = format!("wss://{candidate}");
    }
    Ok(Url::parse(&candidate)?)
}

#[derive(Debug, Clone)]
pub struct CloseFrameInfo {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum WsEvent {
    Pong,
    Book(BookSnapshot),
    PriceChange(PriceChangeSet),
    TickSizeChange(TickSizeChange),
    LastTrade(LastTrade),
    Closed(Option<CloseFrameInfo>),
    Unknown(String),
}

/// Full snapshot for one asset (`event_type == "book"`).
#[derive(Debug, Clone, Deserialize)]
pub struct BookSnapshot {
    pub asset_id: String,
    #[serde(default)]
    pub market: String,
    #[serde(default, alias = "buys")]
    pub bids: Vec<PriceLevel>,
    #[serde(default, alias = "sells")]
    pub asks: Vec<PriceLevel>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub seq: Option<u64>,
}

/// Level deltas, possibly for several assets (`event_type == "price_change"`).
#[derive(Debug, Clone, Deserialize)]
pub struct PriceChangeSet {
    #[serde(default)]
    pub market: String,
    /// Some feed versions put the asset at the top level instead of per entry.
    #[serde(default)]
    pub asset_id: String,
    #[serde(default)]
    pub price_changes: Vec<PriceChangeEntry>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceChangeEntry {
    #[serde(default)]
    pub asset_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub side: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub best_bid: Option<String>,
    #[serde(default)]
    pub best_ask: Option<String>,
}

/// Minimum tick update; metadata only, the book is untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct TickSizeChange {
    pub asset_id: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub old_tick_size: Option<Decimal>,
    pub new_tick_size: Decimal,
    #[serde(default)]
    pub timestamp: String,
}

/// Informational trade print.
#[derive(Debug, Clone, Deserialize)]
pub struct LastTrade {
    pub asset_id: String,
    #[serde(default)]
    pub market: String,
    pub price: Decimal,
    #[serde(default)]
    pub size: Option<Decimal>,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn parses_book_snapshot() {
        let text = r#"{
            "event_type": "book",
            "asset_id": "123",
            "market": "0xc0ffee",
            "bids": [{"price": "0.60", "size": "100"}],
            "asks": [{"price": "0.62", "size": "50"}],
            "timestamp": "1700000000000",
            "hash": "0xabc"
        }"#;
        let events = parse_frames(text);
        assert_eq!(events.len(), 1);
        let WsEvent::Book(book) = &events[0] else {
            panic!("expected book event, got {:?}", events[0]);
        };
        assert_eq!(book.asset_id, "123");
        assert_eq!(book.bids[0].price, dec!(0.60));
        assert_eq!(book.asks[0].size, dec!(50));
        assert_eq!(book.hash, "0xabc");
        assert_eq!(book.seq, None);
    }

    #[test]
    fn splits_initial_snapshot_array() {
        let text = r#"[
            {"event_type": "book", "asset_id": "1", "bids": [], "asks": []},
            {"event_type": "book", "asset_id": "2", "bids": [], "asks": []}
        ]"#;
        let events = parse_frames(text);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|event| matches!(event, WsEvent::Book(_))));
    }

    #[test]
    fn parses_price_change() {
        let text = r#"{
            "event_type": "price_change",
            "market": "0xc0ffee",
            "price_changes": [
                {"asset_id": "123", "price": "0.59", "size": "200", "side": "BUY", "hash": "0xdef"},
                {"asset_id": "123", "price": "0.60", "size": "0", "side": "BUY"}
            ],
            "timestamp": "1700000000001"
        }"#;
        let events = parse_frames(text);
        let WsEvent::PriceChange(set) = &events[0] else {
            panic!("expected price_change, got {:?}", events[0]);
        };
        assert_eq!(set.price_changes.len(), 2);
        assert_eq!(set.price_changes[0].price, dec!(0.59));
        assert_eq!(set.price_changes[0].hash.as_deref(), Some("0xdef"));
        assert_eq!(set.price_changes[1].size, dec!(0));
    }

    #[test]
    fn parses_tick_size_and_trade() {
        let tick = r#"{"event_type":"tick_size_change","asset_id":"123","old_tick_size":"0.01","new_tick_size":"0.001","timestamp":"1"}"#;
        let events = parse_frames(tick);
        let WsEvent::TickSizeChange(change) = &events[0] else {
            panic!("expected tick_size_change");
        };
        assert_eq!(change.new_tick_size, dec!(0.001));

        let trade = r#"{"event_type":"last_trade_price","asset_id":"123","price":"0.61","size":"42","side":"SELL","timestamp":"2"}"#;
        let events = parse_frames(trade);
        let WsEvent::LastTrade(trade) = &events[0] else {
            panic!("expected last_trade_price");
        };
        assert_eq!(trade.price, dec!(0.61));
        assert_eq!(trade.size, Some(dec!(42)));
    }

    #[test]
    fn unknown_and_malformed_frames_are_preserved() {
        let events = parse_frames(r#"{"event_type":"fee_change","asset_id":"1"}"#);
        assert!(matches!(events[0], WsEvent::Unknown(_)));

        let events = parse_frames("not json at all");
        assert!(matches!(events[0], WsEvent::Unknown(_)));

        // Typed field of the wrong shape degrades to Unknown, not a panic.
        let events = parse_frames(r#"{"event_type":"book","asset_id":"1","bids":[{"price":"zero","size":"1"}]}"#);
        assert!(matches!(events[0], WsEvent::Unknown(_)));
    }

    #[test]
    fn subscribe_frame_covers_assets() {
        let assets = vec![TokenId::new("a"), TokenId::new("b"), TokenId::new("c")];
        let frame: Value = serde_json::from_str(&subscribe_frame(&assets)).unwrap();
        assert_eq!(frame["type"], "market");
        let ids: HashSet<&str> = frame["assets_ids"]
            .as_array()
            .unwrap()
            .iter()
            .map(|value| value.as_str().unwrap())
            .collect();
        assert_eq!(ids, HashSet::from(["a", "b", "c"]));
        assert!(frame.get("action").is_none());

        let frame: Value = serde_json::from_str(&unsubscribe_frame(&assets)).unwrap();
        assert_eq!(frame["action"], "unsubscribe");
    }

    #[test]
    fn backoff_schedule_caps_at_max() {
        let backoff = ExponentialBackoff::default();
        let mut delay = backoff.initial;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = backoff.advance(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn ws_url_normalization() {
        assert_eq!(
            normalize_ws_url("https://clob.example.com/ws/market")
                .unwrap()
                .as_str(),
            "wss://clob.example.com/ws/market"
        );
        assert_eq!(
            normalize_ws_url("clob.example.com/ws/market")
                .unwrap()
                .scheme(),
            "wss"
        );
        assert!(normalize_ws_url("").is_err());
    }

    #[test]
    fn state_cell_reads_latest() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), WsState::Disconnected);
        cell.set(WsState::Connected);
        assert_eq!(cell.get(), WsState::Connected);
        let clone = cell.clone();
        clone.set(WsState::Closing);
        assert_eq!(cell.get(), WsState::Closing);
    }
}
