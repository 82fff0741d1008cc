//! Per-asset orderbook state and the shared book store.
//!
//! Books are kept as sorted price maps behind one reader/writer lock. The
//! network worker is the only writer; any thread may take consistent copies
//! out through the read lock.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Write as _,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{SystemTime, UNIX_EPOCH},
};

use alloy::primitives::keccak256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TokenId;

/// One price level. Levels with size zero mean "remove this price".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    /// Parses the wire spellings (`BUY`/`SELL`, `BID`/`ASK`), case-insensitive.
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("buy") || value.eq_ignore_ascii_case("bid") {
            Some(Side::Bid)
        } else if value.eq_ignore_ascii_case("sell") || value.eq_ignore_ascii_case("ask") {
            Some(Side::Ask)
        } else {
            None
        }
    }
}

/// One incremental level change from a `price_change` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelChange {
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// Conditions that invalidate a book. Every variant is a resync signal; none
/// of them is surfaced to users once recovery has replaced the book.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookError {
    #[error("no book for asset {0}")]
    UnknownAsset(TokenId),
    #[error("sequence regression: last applied {last}, got {got}")]
    SequenceRegression { last: u64, got: u64 },
    #[error("book hash mismatch: frame {frame}, computed {computed}")]
    HashMismatch { frame: String, computed: String },
    #[error("crossed book: bid {bid} >= ask {ask}")]
    CrossedBook { bid: Decimal, ask: Decimal },
}

/// Live book for one asset id.
#[derive(Debug, Clone, Default)]
pub struct Orderbook {
    pub asset_id: TokenId,
    /// Price → size, best bid = highest key.
    pub bids: BTreeMap<Decimal, Decimal>,
    /// Price → size, best ask = lowest key.
    pub asks: BTreeMap<Decimal, Decimal>,
    /// Server-reported book token, or the local digest when the frame
    /// carried none.
    pub hash: String,
    /// Local receipt time.
    pub timestamp_ns: u64,
    /// Server-assigned sequence of the last applied frame, when delivered.
    pub seq: Option<u64>,
    /// Set when the book was invalidated and not yet resynced; both sides
    /// are empty while stale.
    pub stale: bool,
}

impl Orderbook {
    pub fn new(asset_id: TokenId) -> Self {
        Self {
            asset_id,
            ..Self::default()
        }
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.last_key_value().map(|(price, _)| *price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(price, _)| *price)
    }

    /// Bid levels, best (highest) first.
    pub fn bid_levels(&self) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .rev()
            .map(|(price, size)| PriceLevel {
                price: *price,
                size: *size,
            })
            .collect()
    }

    /// Ask levels, best (lowest) first.
    pub fn ask_levels(&self) -> Vec<PriceLevel> {
        self.asks
            .iter()
            .map(|(price, size)| PriceLevel {
                price: *price,
                size: *size,
            })
            .collect()
    }

    /// Canonical digest over the asset id and both sides, best to worst.
    /// Prices and sizes are normalized so `0.50` and `0.5` hash alike.
    pub fn digest(&self) -> String {
        let mut buf = String::with_capacity(64 + 16 * (self.bids.len() + self.asks.len()));
        buf.push_str(self.asset_id.as_str());
        for (price, size) in self.bids.iter().rev() {
            let _ = write!(buf, "|b{}:{}", price.normalize(), size.normalize());
        }
        for (price, size) in self.asks.iter() {
            let _ = write!(buf, "|a{}:{}", price.normalize(), size.normalize());
        }
        keccak256(buf.as_bytes()).to_string()
    }

    fn crossed(&self) -> Option<(Decimal, Decimal)> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) if bid >= ask => Some((bid, ask)),
            _ => None,
        }
    }

    fn mark_stale(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.stale = true;
    }

    fn truncate_depth(&mut self, max_depth: usize) {
        while self.bids.len() > max_depth {
            self.bids.pop_first();
        }
        while self.asks.len() > max_depth {
            self.asks.pop_last();
        }
    }
}

/// Shared store of per-asset books guarded by a reader/writer lock.
///
/// Writers (the network worker) hold the lock only for the duration of one
/// apply; readers copy books out. The lock is never held across a callback.
#[derive(Debug)]
pub struct BookStore {
    books: RwLock<HashMap<TokenId, Orderbook>>,
    max_depth: usize,
}

impl BookStore {
    pub fn new(max_depth: usize) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            max_depth,
        }
    }

    /// Atomically replaces both sides of the book for `asset_id`. Any
    /// in-progress delta state is invalidated by construction. A crossed
    /// snapshot leaves the book stale and reports the protocol error.
    pub fn apply_snapshot(
        &self,
        asset_id: &TokenId,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        hash: &str,
        seq: Option<u64>,
    ) -> Result<Orderbook, BookError> {
        let mut book = Orderbook::new(asset_id.clone());
        for level in bids {
            if level.size > Decimal::ZERO {
                book.bids.insert(level.price, level.size);
            }
        }
        for level in asks {
            if level.size > Decimal::ZERO {
                book.asks.insert(level.price, level.size);
            }
        }
        book.seq = seq;
        book.timestamp_ns = now_ns();

        if let Some((bid, ask)) = book.crossed() {
            book.mark_stale();
            book.hash = book.digest();
            self.write().insert(asset_id.clone(), book);
            return Err(BookError::CrossedBook { bid, ask });
        }

        book.hash = if hash.is_empty() {
            book.digest()
        } else {
            hash.to_string()
        };
        book.truncate_depth(self.max_depth);
        self.write().insert(asset_id.clone(), book.clone());
        Ok(book)
    }

    /// Applies level changes to an existing book. Sequence regressions leave
    /// the book untouched; hash mismatches and crossed results mark it stale.
    /// Either way the error is a resync signal for the caller.
    pub fn apply_delta(
        &self,
        asset_id: &TokenId,
        changes: &[LevelChange],
        hash: &str,
        seq: Option<u64>,
    ) -> Result<Orderbook, BookError> {
        let mut books = self.write();
        let book = books
            .get_mut(asset_id.as_str())
            .ok_or_else(|| BookError::UnknownAsset(asset_id.clone()))?;

        // Regression rule only applies when both sides carry a sequence.
        if let (Some(last), Some(got)) = (book.seq, seq) {
            if got <= last {
                return Err(BookError::SequenceRegression { last, got });
            }
        }

        for change in changes {
            let side = match change.side {
                Side::Bid => &mut book.bids,
                Side::Ask => &mut book.asks,
            };
            if change.size <= Decimal::ZERO {
                side.remove(&change.price);
            } else {
                side.insert(change.price, change.size);
            }
        }

        let computed = book.digest();
        if !hash.is_empty() && hash != computed {
            book.mark_stale();
            return Err(BookError::HashMismatch {
                frame: hash.to_string(),
                computed,
            });
        }
        if let Some((bid, ask)) = book.crossed() {
            book.mark_stale();
            return Err(BookError::CrossedBook { bid, ask });
        }

        book.hash = if hash.is_empty() {
            computed
        } else {
            hash.to_string()
        };
        if seq.is_some() {
            book.seq = seq;
        }
        book.timestamp_ns = now_ns();
        book.truncate_depth(self.max_depth);
        Ok(book.clone())
    }

    /// Consistent copy of the book, taken under the read lock.
    pub fn get(&self, asset_id: &TokenId) -> Option<Orderbook> {
        self.read().get(asset_id.as_str()).cloned()
    }

    pub fn best_bid(&self, asset_id: &TokenId) -> Option<Decimal> {
        self.read()
            .get(asset_id.as_str())
            .and_then(Orderbook::best_bid)
    }

    pub fn best_ask(&self, asset_id: &TokenId) -> Option<Decimal> {
        self.read()
            .get(asset_id.as_str())
            .and_then(Orderbook::best_ask)
    }

    /// Zeroes both sides and flags the book until a resync replaces it.
    pub fn mark_stale(&self, asset_id: &TokenId) {
        if let Some(book) = self.write().get_mut(asset_id.as_str()) {
            book.mark_stale();
        }
    }

    pub fn remove(&self, asset_id: &TokenId) {
        self.write().remove(asset_id.as_str());
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TokenId, Orderbook>> {
        self.books.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TokenId, Orderbook>> {
        self.books.write().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
