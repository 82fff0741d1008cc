//! Live orderbook subscription manager.
//!
//! Owns the websocket transport and the book store, demultiplexes inbound
//! frames per asset, keeps books consistent (snapshot/delta/resync), and
//! fires the arbitrage callback on rising edges of the combined best bid.

use std::{
    cell::Cell,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::{Duration, Instant},
};

use rust_decimal::Decimal;
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    errors::{WsClientError, WsResult},
    market_fetcher::MarketFetcher,
    orderbook::{BookStore, LevelChange, Orderbook, Side},
    types::{ConditionId, MarketState, TokenId},
    ws_client::{
        BookSnapshot, ExponentialBackoff, LastTrade, PriceChangeSet, StateCell, TickSizeChange,
        TransportStats, WsClient, WsConfig, WsConnection, WsEvent, WsState,
    },
};

pub type OrderbookUpdateCallback = Arc<dyn Fn(&TokenId, &Orderbook) + Send + Sync>;
pub type ArbOpportunityCallback = Arc<dyn Fn(&MarketState, Decimal) + Send + Sync>;
pub type LastTradeCallback = Arc<dyn Fn(&TokenId, &LastTrade) + Send + Sync>;

/// How long each blocking read may run before the worker services pings and
/// commands again.
const READ_SLICE: Duration = Duration::from_millis(250);

/// Live pair owned exclusively by the manager registry. Books are looked up
/// in the store by token id, so this holds no book references.
#[derive(Debug)]
pub struct LiveMarketState {
    state: MarketState,
    tick_size: Option<Decimal>,
    arb_armed: bool,
}

impl LiveMarketState {
    fn new(state: MarketState) -> Self {
        Self {
            state,
            tick_size: None,
            arb_armed: true,
        }
    }

    pub fn state(&self) -> &MarketState {
        &self.state
    }

    pub fn tick_size(&self) -> Option<Decimal> {
        self.tick_size
    }
}

/// Rising-edge arbitrage detector with a re-arm band below the threshold.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArbDetector {
    threshold: Decimal,
    hysteresis: Decimal,
}

impl ArbDetector {
    pub(crate) fn new(threshold: Decimal, hysteresis: Decimal) -> Self {
        Self {
            threshold,
            hysteresis,
        }
    }

    /// Returns true when the callback should fire. `armed` flips false on a
    /// fire and back to true once `combined` drops below the re-arm band.
    pub(crate) fn evaluate(&self, armed: &mut bool, combined: Decimal) -> bool {
        if *armed {
            if combined > self.threshold {
                *armed = false;
                return true;
            }
        } else if combined < self.threshold - self.hysteresis {
            *armed = true;
        }
        false
    }
}

/// Point-in-time snapshot of the manager counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub total_updates: u64,
    pub arb_opportunities: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub resyncs: u64,
    pub unknown_messages: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_updates: AtomicU64,
    arb_opportunities: AtomicU64,
    resyncs: AtomicU64,
    unknown_messages: AtomicU64,
}

#[derive(Debug, Default)]
struct Registry {
    markets: HashMap<ConditionId, LiveMarketState>,
    token_to_condition: HashMap<TokenId, ConditionId>,
    subscribed: Vec<TokenId>,
}

#[derive(Default)]
struct Callbacks {
    update: RwLock<Option<OrderbookUpdateCallback>>,
    arb: RwLock<Option<ArbOpportunityCallback>>,
    trade: RwLock<Option<LastTradeCallback>>,
}

enum Command {
    Subscribe(Vec<TokenId>),
    Unsubscribe(Vec<TokenId>),
    Stop,
}

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

fn in_callback() -> bool {
    IN_CALLBACK.with(Cell::get)
}

struct CallbackGuard;

impl CallbackGuard {
    fn enter() -> Self {
        IN_CALLBACK.with(|flag| flag.set(true));
        CallbackGuard
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        IN_CALLBACK.with(|flag| flag.set(false));
    }
}

struct ManagerInner {
    config: Config,
    ws_config: WsConfig,
    fetcher: MarketFetcher,
    store: BookStore,
    registry: RwLock<Registry>,
    callbacks: Callbacks,
    counters: Counters,
    detector: ArbDetector,
    state: StdMutex<StateCell>,
    transport: StdMutex<Option<Arc<TransportStats>>>,
    commands: StdMutex<Option<mpsc::UnboundedSender<Command>>>,
}

/// Subscription manager for live market orderbooks.
pub struct OrderbookManager {
    inner: Arc<ManagerInner>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl OrderbookManager {
    pub fn new(config: Config) -> crate::errors::Result<Self> {
        let fetcher = MarketFetcher::new(&config)?;
        let store = BookStore::new(config.max_depth);
        let detector = ArbDetector::new(config.arb_threshold, config.arb_hysteresis);
        let ws_config = WsConfig {
            url: config.ws_url.clone(),
            ping_interval: Duration::from_millis(config.ping_interval_ms.max(1)),
            auto_reconnect: config.auto_reconnect,
            backoff: ExponentialBackoff::default(),
        };
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                ws_config,
                fetcher,
                store,
                registry: RwLock::new(Registry::default()),
                callbacks: Callbacks::default(),
                counters: Counters::default(),
                detector,
                state: StdMutex::new(StateCell::default()),
                transport: StdMutex::new(None),
                commands: StdMutex::new(None),
            }),
            worker: StdMutex::new(None),
        })
    }

    /// Registers a market for streaming. Idempotent; when connected, a delta
    /// subscribe frame is sent for any newly added asset ids.
    pub fn subscribe(&self, market: &MarketState) -> WsResult<()> {
        if in_callback() {
            return Err(WsClientError::Reentrant);
        }
        let added = self.inner.register(market);
        if !added.is_empty() {
            self.inner.send_command(Command::Subscribe(added));
        }
        Ok(())
    }

    pub fn subscribe_all(&self, markets: &[MarketState]) -> WsResult<()> {
        if in_callback() {
            return Err(WsClientError::Reentrant);
        }
        let mut added = Vec::new();
        for market in markets {
            added.extend(self.inner.register(market));
        }
        if !added.is_empty() {
            self.inner.send_command(Command::Subscribe(added));
        }
        Ok(())
    }

    /// Drops one asset: removes it from the registry, discards its book, and
    /// instructs the server. The market entry goes once both legs are gone.
    pub fn unsubscribe(&self, token_id: &TokenId) -> WsResult<()> {
        if in_callback() {
            return Err(WsClientError::Reentrant);
        }
        {
            let mut registry = self.inner.write_registry();
            registry.subscribed.retain(|token| token != token_id);
            if let Some(condition) = registry.token_to_condition.remove(token_id) {
                let still_mapped = registry
                    .token_to_condition
                    .values()
                    .any(|mapped| *mapped == condition);
                if !still_mapped {
                    registry.markets.remove(&condition);
                }
            }
        }
        self.inner.store.remove(token_id);
        self.inner
            .send_command(Command::Unsubscribe(vec![token_id.clone()]));
        Ok(())
    }

    pub fn unsubscribe_all(&self) -> WsResult<()> {
        if in_callback() {
            return Err(WsClientError::Reentrant);
        }
        let all = {
            let mut registry = self.inner.write_registry();
            registry.markets.clear();
            registry.token_to_condition.clear();
            std::mem::take(&mut registry.subscribed)
        };
        self.inner.store.clear();
        if !all.is_empty() {
            self.inner.send_command(Command::Unsubscribe(all));
        }
        Ok(())
    }

    /// Consistent copy of the current book. Stale books come back with the
    /// `stale` flag set and both sides empty.
    pub fn get_orderbook(&self, token_id: &TokenId) -> Option<Orderbook> {
        self.inner.store.get(token_id)
    }

    pub fn get_market(&self, condition_id: &ConditionId) -> Option<MarketState> {
        self.inner
            .read_registry()
            .markets
            .get(condition_id)
            .map(|live| live.state().clone())
    }

    /// Latest minimum tick for a token, if the server announced one.
    pub fn tick_size(&self, token_id: &TokenId) -> Option<Decimal> {
        let registry = self.inner.read_registry();
        let condition = registry.token_to_condition.get(token_id)?;
        registry.markets.get(condition)?.tick_size()
    }

    pub fn subscribed_tokens(&self) -> Vec<TokenId> {
        self.inner.read_registry().subscribed.clone()
    }

    pub fn on_orderbook_update<F>(&self, callback: F)
    where
        F: Fn(&TokenId, &Orderbook) + Send + Sync + 'static,
    {
        *self.inner.write_lock(&self.inner.callbacks.update) = Some(Arc::new(callback));
    }

    pub fn on_arb_opportunity<F>(&self, callback: F)
    where
        F: Fn(&MarketState, Decimal) + Send + Sync + 'static,
    {
        *self.inner.write_lock(&self.inner.callbacks.arb) = Some(Arc::new(callback));
    }

    pub fn on_last_trade<F>(&self, callback: F)
    where
        F: Fn(&TokenId, &LastTrade) + Send + Sync + 'static,
    {
        *self.inner.write_lock(&self.inner.callbacks.trade) = Some(Arc::new(callback));
    }

    /// Dials the websocket, subscribes everything in the registry, and hands
    /// the session to the worker task. Returns once the worker owns it.
    pub async fn connect(&self) -> WsResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let client = WsClient::new(self.inner.ws_config.clone())?;
        let mut connection = client.connect().await?;

        let tokens = self.subscribed_tokens();
        if !tokens.is_empty() {
            connection.subscribe_assets(&tokens).await?;
        }

        *self.inner.lock(&self.inner.state) = client.state_cell();
        *self.inner.lock(&self.inner.transport) = Some(client.stats());

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.lock(&self.inner.commands) = Some(tx);

        let handle = tokio::spawn(worker_loop(self.inner.clone(), connection, rx));
        *self.inner.lock(&self.worker) = Some(handle);
        Ok(())
    }

    /// Requests shutdown; the worker drains in-flight callbacks and exits.
    pub fn stop(&self) {
        self.inner.send_command(Command::Stop);
    }

    /// Stops the worker and waits for it to finish.
    pub async fn disconnect(&self) {
        self.stop();
        self.run().await;
        *self.inner.lock(&self.inner.commands) = None;
    }

    /// Blocks until the worker exits (via `stop`, `disconnect`, or a fatal
    /// transport error with auto-reconnect disabled).
    pub async fn run(&self) {
        let handle = self.inner.lock(&self.worker).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.state() == WsState::Connected
    }

    pub fn state(&self) -> WsState {
        self.inner.lock(&self.inner.state).get()
    }

    pub fn statistics(&self) -> Statistics {
        let (messages_received, bytes_received) = self
            .inner
            .lock(&self.inner.transport)
            .as_ref()
            .map(|stats| (stats.messages_received(), stats.bytes_received()))
            .unwrap_or((0, 0));
        Statistics {
            total_updates: self.inner.counters.total_updates.load(Ordering::Acquire),
            arb_opportunities: self
                .inner
                .counters
                .arb_opportunities
                .load(Ordering::Acquire),
            messages_received,
            bytes_received,
            resyncs: self.inner.counters.resyncs.load(Ordering::Acquire),
            unknown_messages: self.inner.counters.unknown_messages.load(Ordering::Acquire),
        }
    }

    pub fn total_updates(&self) -> u64 {
        self.inner.counters.total_updates.load(Ordering::Acquire)
    }

    pub fn arb_opportunities(&self) -> u64 {
        self.inner
            .counters
            .arb_opportunities
            .load(Ordering::Acquire)
    }

    #[cfg(test)]
    async fn dispatch(&self, event: WsEvent) {
        self.inner.dispatch(event).await;
    }
}

impl ManagerInner {
    fn register(&self, market: &MarketState) -> Vec<TokenId> {
        let mut added = Vec::new();
        let mut registry = self.write_registry();
        let condition = market.condition_id.clone();
        for token in [&market.token_yes, &market.token_no] {
            if token.is_empty() {
                continue;
            }
            if !registry.subscribed.contains(token) {
                registry.subscribed.push(token.clone());
                added.push(token.clone());
            }
            registry
                .token_to_condition
                .insert(token.clone(), condition.clone());
        }
        registry
            .markets
            .entry(condition)
            .or_insert_with(|| LiveMarketState::new(market.clone()));
        added
    }

    fn send_command(&self, command: Command) {
        if let Some(tx) = self.lock(&self.commands).as_ref() {
            let _ = tx.send(command);
        }
    }

    async fn dispatch(&self, event: WsEvent) {
        match event {
            WsEvent::Book(snapshot) => self.handle_book(snapshot).await,
            WsEvent::PriceChange(set) => self.handle_price_change(set).await,
            WsEvent::TickSizeChange(change) => self.handle_tick_size(change),
            WsEvent::LastTrade(trade) => self.handle_trade(trade),
            WsEvent::Unknown(_) => {
                self.counters.unknown_messages.fetch_add(1, Ordering::Release);
            }
            // Pong liveness and close frames are handled by the worker loop.
            WsEvent::Pong | WsEvent::Closed(_) => {}
        }
    }

    async fn handle_book(&self, snapshot: BookSnapshot) {
        let token = TokenId::new(snapshot.asset_id.clone());
        match self.store.apply_snapshot(
            &token,
            &snapshot.bids,
            &snapshot.asks,
            &snapshot.hash,
            snapshot.seq,
        ) {
            Ok(book) => self.after_apply(&token, &book),
            Err(err) => {
                warn!(asset = %token, error = %err, "book snapshot rejected");
                self.resync(&token).await;
            }
        }
    }

    async fn handle_price_change(&self, set: PriceChangeSet) {
        // Group changes per asset, preserving arrival order. The last hash in
        // a batch is the server's post-apply book hash for that asset.
        let mut grouped: Vec<(TokenId, Vec<LevelChange>, String)> = Vec::new();
        for entry in &set.price_changes {
            let asset = if entry.asset_id.is_empty() {
                set.asset_id.as_str()
            } else {
                entry.asset_id.as_str()
            };
            if asset.is_empty() {
                continue;
            }
            let Some(side) = Side::parse(&entry.side) else {
                warn!(side = %entry.side, "unknown side in price change");
                continue;
            };
            let change = LevelChange {
                side,
                price: entry.price,
                size: entry.size,
            };
            let hash = entry.hash.clone().unwrap_or_default();
            match grouped
                .iter_mut()
                .find(|(token, _, _)| token.as_str() == asset)
            {
                Some((_, changes, batch_hash)) => {
                    changes.push(change);
                    if !hash.is_empty() {
                        *batch_hash = hash;
                    }
                }
                None => grouped.push((TokenId::new(asset), vec![change], hash)),
            }
        }

        for (token, changes, hash) in grouped {
            match self.store.apply_delta(&token, &changes, &hash, set.seq) {
                Ok(book) => self.after_apply(&token, &book),
                Err(err) => {
                    warn!(asset = %token, error = %err, "price change rejected");
                    self.resync(&token).await;
                }
            }
        }
    }

    fn handle_tick_size(&self, change: TickSizeChange) {
        let token = TokenId::new(change.asset_id);
        let mut registry = self.write_registry();
        if let Some(condition) = registry.token_to_condition.get(&token).cloned() {
            if let Some(market) = registry.markets.get_mut(&condition) {
                debug!(asset = %token, tick = %change.new_tick_size, "tick size updated");
                market.tick_size = Some(change.new_tick_size);
            }
        }
    }

    fn handle_trade(&self, trade: LastTrade) {
        let token = TokenId::new(trade.asset_id.clone());
        let callback = self.read_lock(&self.callbacks.trade).clone();
        if let Some(callback) = callback {
            let _guard = CallbackGuard::enter();
            callback(&token, &trade);
        }
    }

    fn after_apply(&self, token: &TokenId, book: &Orderbook) {
        self.counters.total_updates.fetch_add(1, Ordering::Release);
        let callback = self.read_lock(&self.callbacks.update).clone();
        if let Some(callback) = callback {
            let _guard = CallbackGuard::enter();
            callback(token, book);
        }
        self.check_arb(token);
    }

    /// Replaces an invalidated book with a fresh REST snapshot. On failure
    /// the book stays stale until the next server snapshot.
    async fn resync(&self, token: &TokenId) {
        if !self.is_subscribed(token) {
            return;
        }
        self.counters.resyncs.fetch_add(1, Ordering::Release);
        match self.fetcher.fetch_orderbook(token).await {
            Ok(Some(book)) => {
                let bids = book.bid_levels();
                let asks = book.ask_levels();
                match self
                    .store
                    .apply_snapshot(token, &bids, &asks, &book.hash, book.seq)
                {
                    Ok(fresh) => {
                        debug!(asset = %token, "book resynced from REST snapshot");
                        self.after_apply(token, &fresh);
                    }
                    Err(err) => {
                        warn!(asset = %token, error = %err, "resync snapshot invalid");
                    }
                }
            }
            Ok(None) => {
                warn!(asset = %token, "resync snapshot unavailable");
                self.store.mark_stale(token);
            }
            Err(err) => {
                warn!(asset = %token, error = %err, "resync fetch failed");
                self.store.mark_stale(token);
            }
        }
    }

    fn check_arb(&self, token: &TokenId) {
        let pair = {
            let registry = self.read_registry();
            let Some(condition) = registry.token_to_condition.get(token) else {
                return;
            };
            registry.markets.get(condition).map(|market| {
                (
                    condition.clone(),
                    market.state.token_yes.clone(),
                    market.state.token_no.clone(),
                )
            })
        };
        let Some((condition, yes, no)) = pair else {
            return;
        };
        let (Some(yes_bid), Some(no_bid)) = (self.store.best_bid(&yes), self.store.best_bid(&no))
        else {
            return;
        };
        let combined = yes_bid + no_bid;

        let fired = {
            let mut registry = self.write_registry();
            let Some(market) = registry.markets.get_mut(&condition) else {
                return;
            };
            if self.detector.evaluate(&mut market.arb_armed, combined) {
                Some(market.state.clone())
            } else {
                None
            }
        };

        if let Some(state) = fired {
            self.counters
                .arb_opportunities
                .fetch_add(1, Ordering::Release);
            info!(condition = %state.condition_id, %combined, "arbitrage opportunity");
            let callback = self.read_lock(&self.callbacks.arb).clone();
            if let Some(callback) = callback {
                let _guard = CallbackGuard::enter();
                callback(&state, combined);
            }
        }
    }

    fn is_subscribed(&self, token: &TokenId) -> bool {
        self.read_registry().subscribed.contains(token)
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_lock<'a, T>(&self, lock: &'a RwLock<T>) -> RwLockReadGuard<'a, T> {
        lock.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock<'a, T>(&self, lock: &'a RwLock<T>) -> RwLockWriteGuard<'a, T> {
        lock.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock<'a, T>(&self, lock: &'a StdMutex<T>) -> std::sync::MutexGuard<'a, T> {
        lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The network worker: single task owning the connection. All user callbacks
/// run here, serialized in wire order.
async fn worker_loop(
    inner: Arc<ManagerInner>,
    mut connection: WsConnection,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let ping_interval = inner.ws_config.ping_interval;
    let stale_after = ping_interval * 2;
    let read_slice = READ_SLICE.min(ping_interval);
    let mut last_ping = Instant::now();
    let mut stopping = false;

    loop {
        loop {
            match commands.try_recv() {
                Ok(Command::Subscribe(tokens)) => {
                    if let Err(err) = connection.subscribe_assets(&tokens).await {
                        warn!(error = %err, "subscribe frame failed");
                    }
                }
                Ok(Command::Unsubscribe(tokens)) => {
                    if let Err(err) = connection.unsubscribe_assets(&tokens).await {
                        warn!(error = %err, "unsubscribe frame failed");
                    }
                }
                Ok(Command::Stop) => {
                    stopping = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    stopping = true;
                    break;
                }
            }
        }
        if stopping {
            break;
        }

        if connection.pong_overdue(stale_after) {
            warn!("closing connection: stale (two missed pongs)");
            if !recover(&inner, &mut connection, "stale").await {
                break;
            }
            last_ping = Instant::now();
            continue;
        }
        if last_ping.elapsed() >= ping_interval {
            if let Err(err) = connection.ping().await {
                warn!(error = %err, "ping failed");
                if !recover(&inner, &mut connection, "ping").await {
                    break;
                }
            }
            last_ping = Instant::now();
        }

        // Bounded read keeps the loop responsive for pings and commands even
        // when the feed is quiet.
        match timeout(read_slice, connection.next_event()).await {
            Err(_) => {}
            Ok(Ok(Some(WsEvent::Closed(info)))) => {
                warn!(?info, "server closed connection");
                if !recover(&inner, &mut connection, "close").await {
                    break;
                }
                last_ping = Instant::now();
            }
            Ok(Ok(Some(event))) => inner.dispatch(event).await,
            Ok(Ok(None)) => {
                if !recover(&inner, &mut connection, "eof").await {
                    break;
                }
                last_ping = Instant::now();
            }
            Ok(Err(err)) => {
                warn!(error = %err, "transport error");
                if !recover(&inner, &mut connection, "error").await {
                    break;
                }
                last_ping = Instant::now();
            }
        }
    }

    let _ = connection.close().await;
    // Books do not outlive the session.
    inner.store.clear();
    info!("market stream worker stopped");
}

/// Reconnects with backoff and resubscribes the registry. Returns false when
/// the session should end instead (auto-reconnect disabled).
async fn recover(inner: &Arc<ManagerInner>, connection: &mut WsConnection, reason: &str) -> bool {
    if !inner.ws_config.auto_reconnect {
        info!(reason, "auto-reconnect disabled, ending session");
        return false;
    }
    info!(reason, "reconnecting market stream");
    if connection.reconnect(None).await.is_err() {
        return false;
    }
    let tokens = inner.read_registry().subscribed.clone();
    if !tokens.is_empty() {
        if let Err(err) = connection.subscribe_assets(&tokens).await {
            warn!(error = %err, "resubscribe after reconnect failed");
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    use rust_decimal_macros::dec;

    use super::*;
    use crate::orderbook::PriceLevel;

    fn market_state() -> MarketState {
        MarketState {
            condition_id: ConditionId::new("0xc0ffee"),
            token_yes: TokenId::new("yes-token"),
            token_no: TokenId::new("no-token"),
            title: "Will it settle yes?".to_string(),
            symbol: "test".to_string(),
            slug: "will-it-settle-yes".to_string(),
        }
    }

    fn test_manager() -> Arc<OrderbookManager> {
        let config = Config {
            // unreachable address so resyncs fail fast without a network
            clob_rest_url: "http://127.0.0.1:9".to_string(),
            gamma_api_url: "http://127.0.0.1:9".to_string(),
            ..Config::default()
        };
        Arc::new(OrderbookManager::new(config).unwrap())
    }

    fn book_event(asset: &str, bid: Decimal, ask: Decimal, seq: Option<u64>) -> WsEvent {
        WsEvent::Book(BookSnapshot {
            asset_id: asset.to_string(),
            market: String::new(),
            bids: vec![PriceLevel {
                price: bid,
                size: dec!(100),
            }],
            asks: vec![PriceLevel {
                price: ask,
                size: dec!(100),
            }],
            timestamp: String::new(),
            hash: String::new(),
            seq,
        })
    }

    #[test]
    fn arb_detector_fires_on_rising_edge_with_hysteresis() {
        let detector = ArbDetector::new(dec!(1.00), dec!(0.002));
        let mut armed = true;

        assert!(!detector.evaluate(&mut armed, dec!(0.99)));
        assert!(detector.evaluate(&mut armed, dec!(1.01)));
        // Still above threshold: suppressed until re-armed.
        assert!(!detector.evaluate(&mut armed, dec!(1.02)));
        assert!(!detector.evaluate(&mut armed, dec!(1.01)));
        // Exactly at the re-arm band edge does not re-arm.
        assert!(!detector.evaluate(&mut armed, dec!(0.998)));
        assert!(!armed);
        // Below threshold - hysteresis re-arms.
        assert!(!detector.evaluate(&mut armed, dec!(0.997)));
        assert!(armed);
        assert!(detector.evaluate(&mut armed, dec!(1.01)));
    }

    #[test]
    fn threshold_itself_is_not_an_edge() {
        let detector = ArbDetector::new(dec!(1.00), dec!(0.002));
        let mut armed = true;
        assert!(!detector.evaluate(&mut armed, dec!(1.00)));
        assert!(armed);
    }

    #[test]
    fn subscribe_is_idempotent_and_covers_both_legs() {
        let manager = test_manager();
        manager.subscribe(&market_state()).unwrap();
        manager.subscribe(&market_state()).unwrap();

        let tokens = manager.subscribed_tokens();
        assert_eq!(tokens.len(), 2);
        assert!(tokens.contains(&TokenId::new("yes-token")));
        assert!(tokens.contains(&TokenId::new("no-token")));
        assert!(manager
            .get_market(&ConditionId::new("0xc0ffee"))
            .is_some());
    }

    #[test]
    fn unsubscribe_drops_book_and_market() {
        let manager = test_manager();
        manager.subscribe(&market_state()).unwrap();

        manager.unsubscribe(&TokenId::new("yes-token")).unwrap();
        assert_eq!(manager.subscribed_tokens().len(), 1);
        // Market survives while one leg is still mapped.
        assert!(manager
            .get_market(&ConditionId::new("0xc0ffee"))
            .is_some());

        manager.unsubscribe(&TokenId::new("no-token")).unwrap();
        assert!(manager.subscribed_tokens().is_empty());
        assert!(manager.get_market(&ConditionId::new("0xc0ffee")).is_none());
    }

    #[tokio::test]
    async fn arb_callback_fires_once_per_edge() {
        let manager = test_manager();
        manager.subscribe(&market_state()).unwrap();

        let fired: Arc<Mutex<Vec<Decimal>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        manager.on_arb_opportunity(move |_, combined| {
            sink.lock().unwrap().push(combined);
        });

        // yes 0.55 / no 0.44 → combined 0.99, below threshold.
        manager
            .dispatch(book_event("yes-token", dec!(0.55), dec!(0.60), Some(1)))
            .await;
        manager
            .dispatch(book_event("no-token", dec!(0.44), dec!(0.50), Some(1)))
            .await;
        assert!(fired.lock().unwrap().is_empty());

        // no → 0.46: combined 1.01 crosses the threshold once.
        manager
            .dispatch(book_event("no-token", dec!(0.46), dec!(0.50), Some(2)))
            .await;
        assert_eq!(fired.lock().unwrap().as_slice(), &[dec!(1.01)]);

        // Still in arb: no repeat.
        manager
            .dispatch(book_event("no-token", dec!(0.47), dec!(0.50), Some(3)))
            .await;
        assert_eq!(fired.lock().unwrap().len(), 1);

        // Drop below threshold - hysteresis, then cross again.
        manager
            .dispatch(book_event("no-token", dec!(0.43), dec!(0.50), Some(4)))
            .await;
        manager
            .dispatch(book_event("no-token", dec!(0.47), dec!(0.50), Some(5)))
            .await;
        assert_eq!(fired.lock().unwrap().as_slice(), &[dec!(1.01), dec!(1.02)]);
        assert_eq!(manager.arb_opportunities(), 2);
    }

    #[tokio::test]
    async fn update_callbacks_follow_applies() {
        let manager = test_manager();
        manager.subscribe(&market_state()).unwrap();

        let updates = Arc::new(AtomicU32::new(0));
        let sink = updates.clone();
        manager.on_orderbook_update(move |_, book| {
            assert!(!book.stale);
            sink.fetch_add(1, Ordering::SeqCst);
        });

        manager
            .dispatch(book_event("yes-token", dec!(0.55), dec!(0.60), Some(1)))
            .await;
        manager
            .dispatch(WsEvent::PriceChange(PriceChangeSet {
                market: String::new(),
                asset_id: String::new(),
                price_changes: vec![crate::ws_client::PriceChangeEntry {
                    asset_id: "yes-token".to_string(),
                    price: dec!(0.56),
                    size: dec!(25),
                    side: "BUY".to_string(),
                    hash: None,
                    best_bid: None,
                    best_ask: None,
                }],
                timestamp: String::new(),
                seq: Some(2),
            }))
            .await;

        assert_eq!(updates.load(Ordering::SeqCst), 2);
        assert_eq!(manager.total_updates(), 2);
        let book = manager.get_orderbook(&TokenId::new("yes-token")).unwrap();
        assert_eq!(book.best_bid(), Some(dec!(0.56)));
    }

    #[tokio::test]
    async fn hash_mismatch_triggers_resync_and_no_spurious_updates() {
        let manager = test_manager();
        manager.subscribe(&market_state()).unwrap();

        let updates = Arc::new(AtomicU32::new(0));
        let sink = updates.clone();
        manager.on_orderbook_update(move |_, _| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        manager
            .dispatch(book_event("yes-token", dec!(0.55), dec!(0.60), Some(10)))
            .await;
        assert_eq!(updates.load(Ordering::SeqCst), 1);

        manager
            .dispatch(WsEvent::PriceChange(PriceChangeSet {
                market: String::new(),
                asset_id: String::new(),
                price_changes: vec![crate::ws_client::PriceChangeEntry {
                    asset_id: "yes-token".to_string(),
                    price: dec!(0.56),
                    size: dec!(25),
                    side: "BUY".to_string(),
                    hash: Some("0xdeadbeef".to_string()),
                    best_bid: None,
                    best_ask: None,
                }],
                timestamp: String::new(),
                seq: Some(11),
            }))
            .await;

        // The REST endpoint is unreachable in tests, so the resync attempt
        // leaves the book stale; the invalid state produced no callback.
        assert_eq!(manager.statistics().resyncs, 1);
        assert_eq!(updates.load(Ordering::SeqCst), 1);
        let book = manager.get_orderbook(&TokenId::new("yes-token")).unwrap();
        assert!(book.stale);
        assert_eq!(book.best_bid(), None);
    }

    #[tokio::test]
    async fn subscribing_from_a_callback_is_rejected() {
        let manager = test_manager();
        manager.subscribe(&market_state()).unwrap();

        let observed: Arc<Mutex<Option<WsClientError>>> = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        let reentrant = manager.clone();
        manager.on_orderbook_update(move |_, _| {
            let other = MarketState {
                condition_id: ConditionId::new("0xother"),
                token_yes: TokenId::new("other-yes"),
                token_no: TokenId::new("other-no"),
                ..MarketState::default()
            };
            if let Err(err) = reentrant.subscribe(&other) {
                *sink.lock().unwrap() = Some(err);
            }
        });

        manager
            .dispatch(book_event("yes-token", dec!(0.55), dec!(0.60), Some(1)))
            .await;

        assert!(matches!(
            observed.lock().unwrap().take(),
            Some(WsClientError::Reentrant)
        ));
        // The reentrant subscribe left no trace in the registry.
        assert_eq!(manager.subscribed_tokens().len(), 2);
    }

    #[tokio::test]
    async fn tick_size_updates_metadata_only() {
        let manager = test_manager();
        manager.subscribe(&market_state()).unwrap();
        manager
            .dispatch(book_event("yes-token", dec!(0.55), dec!(0.60), Some(1)))
            .await;
        let before = manager.get_orderbook(&TokenId::new("yes-token")).unwrap();

        manager
            .dispatch(WsEvent::TickSizeChange(crate::ws_client::TickSizeChange {
                asset_id: "yes-token".to_string(),
                market: String::new(),
                old_tick_size: Some(dec!(0.01)),
                new_tick_size: dec!(0.001),
                timestamp: String::new(),
            }))
            .await;

        assert_eq!(
            manager.tick_size(&TokenId::new("yes-token")),
            Some(dec!(0.001))
        );
        let after = manager.get_orderbook(&TokenId::new("yes-token")).unwrap();
        assert_eq!(after.bids, before.bids);
        assert_eq!(after.asks, before.asks);
    }

    #[tokio::test]
    async fn unknown_events_are_counted() {
        let manager = test_manager();
        manager
            .dispatch(WsEvent::Unknown("{\"event_type\":\"??\"}".to_string()))
            .await;
        assert_eq!(manager.statistics().unknown_messages, 1);
        assert_eq!(manager.total_updates(), 0);
    }

    #[tokio::test]
    async fn last_trade_reaches_trade_callback() {
        let manager = test_manager();
        manager.subscribe(&market_state()).unwrap();

        let trades = Arc::new(AtomicU32::new(0));
        let sink = trades.clone();
        manager.on_last_trade(move |token, trade| {
            assert_eq!(token.as_str(), "yes-token");
            assert_eq!(trade.price, dec!(0.58));
            sink.fetch_add(1, Ordering::SeqCst);
        });

        manager
            .dispatch(WsEvent::LastTrade(crate::ws_client::LastTrade {
                asset_id: "yes-token".to_string(),
                market: String::new(),
                price: dec!(0.58),
                size: Some(dec!(10)),
                side: "BUY".to_string(),
                timestamp: String::new(),
            }))
            .await;
        assert_eq!(trades.load(Ordering::SeqCst), 1);
    }
}
