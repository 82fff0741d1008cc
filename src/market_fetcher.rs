//! REST access to the CLOB and Gamma APIs: market discovery, orderbook
//! snapshots (used for resync), and the public read-through endpoints.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    config::Config,
    errors::{ClientError, Result},
    orderbook::{self, Orderbook, PriceLevel},
    signer::OrderSide,
    types::{ClobMarket, ConditionId, MarketState, TokenId},
};

/// Terminal cursor on `/markets` pagination.
const END_CURSOR: &str = "LTE=";

#[derive(Debug, Clone, Deserialize)]
struct MarketsPage {
    #[serde(default)]
    data: Vec<ClobMarket>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BookResponse {
    #[serde(default)]
    asset_id: String,
    #[serde(default)]
    bids: Vec<PriceLevel>,
    #[serde(default)]
    asks: Vec<PriceLevel>,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    seq: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct MidpointResponse {
    mid: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
struct SpreadResponse {
    spread: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
struct PriceResponse {
    price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
struct TickSizeResponse {
    minimum_tick_size: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
struct NegRiskResponse {
    neg_risk: bool,
}

/// Last trade as reported by `/last-trade-price`.
#[derive(Debug, Clone, Deserialize)]
pub struct LastTradeQuote {
    pub price: Decimal,
    #[serde(default)]
    pub side: String,
}

/// Entry from `/rewards/markets/current`; the schema beyond the condition id
/// is open-ended, so extra fields are kept raw.
#[derive(Debug, Clone, Deserialize)]
pub struct RewardsMarket {
    #[serde(default)]
    pub condition_id: String,
    #[serde(default)]
    pub question: String,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct GammaEvent {
    #[serde(default)]
    slug: String,
    #[serde(default)]
    markets: Vec<GammaMarket>,
}

#[derive(Debug, Clone, Deserialize)]
struct GammaMarket {
    #[serde(default)]
    slug: String,
    #[serde(default)]
    question: String,
    #[serde(default, rename = "conditionId")]
    condition_id: String,
    /// Stringified JSON array of the two outcome token ids.
    #[serde(default, rename = "clobTokenIds")]
    clob_token_ids: String,
}

/// REST client for the CLOB and Gamma endpoints consumed by the core.
pub struct MarketFetcher {
    http: Client,
    clob_url: String,
    gamma_url: String,
}

impl MarketFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            clob_url: config.clob_rest_url.trim_end_matches('/').to_string(),
            gamma_url: config.gamma_api_url.trim_end_matches('/').to_string(),
        })
    }

    /// Enumerates `/markets` with cursor pagination until `max_markets` is
    /// reached or the cursor runs out.
    pub async fn fetch_all_markets(&self, max_markets: usize) -> Result<Vec<ClobMarket>> {
        let mut markets = Vec::new();
        let mut cursor: Option<String> = None;

        while markets.len() < max_markets {
            let url = format!("{}/markets", self.clob_url);
            let mut request = self.http.get(&url);
            if let Some(cursor) = &cursor {
                request = request.query(&[("next_cursor", cursor.as_str())]);
            }
            let page: MarketsPage = self.fetch(request).await?;
            if page.data.is_empty() {
                break;
            }
            for market in page.data {
                if markets.len() >= max_markets {
                    break;
                }
                markets.push(market);
            }
            match advance_cursor(page.next_cursor) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(count = markets.len(), "markets fetched");
        Ok(markets)
    }

    /// Markets carrying a usable YES/NO token pair.
    pub async fn fetch_binary_markets(&self, max_markets: usize) -> Result<Vec<ClobMarket>> {
        let all = self
            .fetch_all_markets(max_markets.saturating_mul(5))
            .await?;
        let mut valid: Vec<ClobMarket> = all
            .into_iter()
            .filter(|market| market.has_valid_tokens() && !market.condition_id.is_empty())
            .collect();
        valid.truncate(max_markets);
        Ok(valid)
    }

    pub async fn fetch_market(&self, condition_id: &ConditionId) -> Result<Option<ClobMarket>> {
        let url = format!("{}/markets/{}", self.clob_url, condition_id);
        self.fetch_optional(self.http.get(&url)).await
    }

    /// Orderbook snapshot in store form; the resync path feeds this straight
    /// back into `apply_snapshot`.
    pub async fn fetch_orderbook(&self, token_id: &TokenId) -> Result<Option<Orderbook>> {
        let url = format!("{}/book", self.clob_url);
        let request = self.http.get(&url).query(&[("token_id", token_id.as_str())]);
        let response: Option<BookResponse> = self.fetch_optional(request).await?;
        Ok(response.map(|response| book_from_response(token_id, response)))
    }

    pub async fn midpoint(&self, token_id: &TokenId) -> Result<Option<Decimal>> {
        let url = format!("{}/midpoint", self.clob_url);
        let request = self.http.get(&url).query(&[("token_id", token_id.as_str())]);
        let response: Option<MidpointResponse> = self.fetch_optional(request).await?;
        Ok(response.map(|response| response.mid))
    }

    pub async fn spread(&self, token_id: &TokenId) -> Result<Option<Decimal>> {
        let url = format!("{}/spread", self.clob_url);
        let request = self.http.get(&url).query(&[("token_id", token_id.as_str())]);
        let response: Option<SpreadResponse> = self.fetch_optional(request).await?;
        Ok(response.map(|response| response.spread))
    }

    pub async fn price(&self, token_id: &TokenId, side: OrderSide) -> Result<Option<Decimal>> {
        let url = format!("{}/price", self.clob_url);
        let request = self
            .http
            .get(&url)
            .query(&[("token_id", token_id.as_str()), ("side", side.as_str())]);
        let response: Option<PriceResponse> = self.fetch_optional(request).await?;
        Ok(response.map(|response| response.price))
    }

    pub async fn tick_size(&self, token_id: &TokenId) -> Result<Option<Decimal>> {
        let url = format!("{}/tick-size", self.clob_url);
        let request = self.http.get(&url).query(&[("token_id", token_id.as_str())]);
        let response: Option<TickSizeResponse> = self.fetch_optional(request).await?;
        Ok(response.map(|response| response.minimum_tick_size))
    }

    pub async fn neg_risk(&self, token_id: &TokenId) -> Result<Option<bool>> {
        let url = format!("{}/neg-risk", self.clob_url);
        let request = self.http.get(&url).query(&[("token_id", token_id.as_str())]);
        let response: Option<NegRiskResponse> = self.fetch_optional(request).await?;
        Ok(response.map(|response| response.neg_risk))
    }

    pub async fn last_trade_price(&self, token_id: &TokenId) -> Result<Option<LastTradeQuote>> {
        let url = format!("{}/last-trade-price", self.clob_url);
        let request = self.http.get(&url).query(&[("token_id", token_id.as_str())]);
        self.fetch_optional(request).await
    }

    pub async fn rewards_markets_current(&self) -> Result<Vec<RewardsMarket>> {
        let url = format!("{}/rewards/markets/current", self.clob_url);
        let value: Value = self.fetch(self.http.get(&url)).await?;
        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut object) => match object.remove("data") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        let mut markets = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<RewardsMarket>(item) {
                Ok(market) => markets.push(market),
                Err(err) => warn!(error = %err, "skipping malformed rewards market"),
            }
        }
        Ok(markets)
    }

    /// Server clock from `/time` (unix seconds).
    pub async fn server_time(&self) -> Result<DateTime<Utc>> {
        let url = format!("{}/time", self.clob_url);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ClientError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let seconds: i64 = serde_json::from_str(body.trim())?;
        DateTime::<Utc>::from_timestamp(seconds, 0).ok_or(ClientError::Http {
            status: status.as_u16(),
            body,
        })
    }

    /// Resolves a market through the Gamma metadata API by event slug.
    pub async fn event_market_by_slug(&self, slug: &str) -> Result<Option<MarketState>> {
        let url = format!("{}/events", self.gamma_url);
        let request = self.http.get(&url).query(&[("slug", slug)]);
        let events: Option<Vec<GammaEvent>> = self.fetch_optional(request).await?;
        Ok(events.and_then(market_state_from_events))
    }

    /// Resolved token pair for a CLOB market, with the slug/title fallbacks
    /// applied.
    pub fn to_market_state(market: &ClobMarket) -> MarketState {
        let slug = if market.market_slug.is_empty() {
            market.condition_id.as_str().to_string()
        } else {
            market.market_slug.clone()
        };
        let title = if market.question.is_empty() {
            market.market_slug.clone()
        } else {
            market.question.clone()
        };
        let symbol = slug
            .split('-')
            .next()
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or("unknown")
            .to_string();
        MarketState {
            condition_id: market.condition_id.clone(),
            token_yes: market.token_yes().cloned().unwrap_or_default(),
            token_no: market.token_no().cloned().unwrap_or_default(),
            title,
            symbol,
            slug,
        }
    }

    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    /// Like `fetch`, but a 404 becomes `Ok(None)`.
    async fn fetch_optional<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>> {
        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(Some(response.json().await?))
    }
}

fn advance_cursor(next_cursor: Option<String>) -> Option<String> {
    next_cursor.filter(|cursor| !cursor.is_empty() && cursor != END_CURSOR)
}

fn book_from_response(token_id: &TokenId, response: BookResponse) -> Orderbook {
    let asset = if response.asset_id.is_empty() {
        token_id.clone()
    } else {
        TokenId::new(response.asset_id)
    };
    let mut book = Orderbook::new(asset);
    for level in response.bids {
        if level.size > Decimal::ZERO {
            book.bids.insert(level.price, level.size);
        }
    }
    for level in response.asks {
        if level.size > Decimal::ZERO {
            book.asks.insert(level.price, level.size);
        }
    }
    book.seq = response.seq;
    book.timestamp_ns = orderbook::now_ns();
    book.hash = if response.hash.is_empty() {
        book.digest()
    } else {
        response.hash
    };
    book
}

fn market_state_from_events(events: Vec<GammaEvent>) -> Option<MarketState> {
    let event = events.into_iter().next()?;
    let market = event.markets.into_iter().next()?;
    let token_ids: Vec<String> = serde_json::from_str(&market.clob_token_ids).ok()?;
    if token_ids.len() < 2 || market.condition_id.is_empty() {
        return None;
    }

    let slug = if market.slug.is_empty() {
        event.slug
    } else {
        market.slug
    };
    let symbol = slug
        .split('-')
        .next()
        .filter(|prefix| !prefix.is_empty())
        .unwrap_or("unknown")
        .to_string();
    let title = if market.question.is_empty() {
        slug.clone()
    } else {
        market.question
    };
    Some(MarketState {
        condition_id: ConditionId::new(market.condition_id),
        token_yes: TokenId::new(token_ids[0].clone()),
        token_no: TokenId::new(token_ids[1].clone()),
        title,
        symbol,
        slug,
    })
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn markets_page_decodes() {
        let page: MarketsPage = serde_json::from_str(
            r#"{
                "data": [{
                    "condition_id": "0xc0ffee",
                    "question": "Will it settle yes?",
                    "market_slug": "will-it-settle-yes",
                    "tokens": [
                        {"token_id": "111", "outcome": "Yes"},
                        {"token_id": "222", "outcome": "No"}
                    ],
                    "neg_risk": false,
                    "active": true,
                    "closed": false
                }],
                "next_cursor": "MTAw",
                "limit": 100,
                "count": 1
            }"#,
        )
        .unwrap();
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("MTAw"));
        assert!(page.data[0].has_valid_tokens());
        assert!(page.data[0].active);
    }

    #[test]
    fn cursor_advances_until_terminal() {
        assert_eq!(advance_cursor(Some("MTAw".to_string())).as_deref(), Some("MTAw"));
        assert_eq!(advance_cursor(Some(String::new())), None);
        assert_eq!(advance_cursor(Some("LTE=".to_string())), None);
        assert_eq!(advance_cursor(None), None);
    }

    #[test]
    fn book_response_becomes_store_snapshot() {
        let response: BookResponse = serde_json::from_str(
            r#"{
                "market": "0xc0ffee",
                "asset_id": "111",
                "bids": [{"price": "0.60", "size": "100"}, {"price": "0.59", "size": "0"}],
                "asks": [{"price": "0.62", "size": "50"}],
                "hash": "0xserver",
                "timestamp": "1700000000000"
            }"#,
        )
        .unwrap();
        let book = book_from_response(&TokenId::new("111"), response);

        assert_eq!(book.asset_id.as_str(), "111");
        assert_eq!(book.best_bid(), Some(dec!(0.60)));
        assert_eq!(book.best_ask(), Some(dec!(0.62)));
        // Zero-size level dropped on ingest.
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.hash, "0xserver");
        assert!(!book.stale);
    }

    #[test]
    fn book_response_without_hash_gets_digest() {
        let response: BookResponse =
            serde_json::from_str(r#"{"bids": [{"price": "0.5", "size": "1"}], "asks": []}"#)
                .unwrap();
        let book = book_from_response(&TokenId::new("111"), response);
        assert_eq!(book.hash, book.digest());
    }

    #[test]
    fn market_state_conversion_fallbacks() {
        let market: ClobMarket = serde_json::from_str(
            r#"{
                "condition_id": "0xc0ffee",
                "question": "Will it settle yes?",
                "market_slug": "btc-updown-15m-1700000000",
                "tokens": [
                    {"token_id": "111", "outcome": "Yes"},
                    {"token_id": "222", "outcome": "No"}
                ]
            }"#,
        )
        .unwrap();
        let state = MarketFetcher::to_market_state(&market);
        assert_eq!(state.symbol, "btc");
        assert_eq!(state.token_yes.as_str(), "111");
        assert_eq!(state.title, "Will it settle yes?");

        // Missing slug falls back to the condition id; missing question to
        // the slug.
        let bare: ClobMarket =
            serde_json::from_str(r#"{"condition_id": "0xbare", "tokens": []}"#).unwrap();
        let state = MarketFetcher::to_market_state(&bare);
        assert_eq!(state.slug, "0xbare");
        assert_eq!(state.symbol, "0xbare");
        assert!(state.token_yes.is_empty());
    }

    #[test]
    fn gamma_event_parses_token_pair() {
        let events: Vec<GammaEvent> = serde_json::from_str(
            r#"[{
                "slug": "btc-updown-15m-1700000000",
                "markets": [{
                    "slug": "btc-updown-15m-1700000000",
                    "question": "Bitcoin up or down?",
                    "conditionId": "0xc0ffee",
                    "clobTokenIds": "[\"111\", \"222\"]"
                }]
            }]"#,
        )
        .unwrap();
        let state = market_state_from_events(events).unwrap();
        assert_eq!(state.condition_id.as_str(), "0xc0ffee");
        assert_eq!(state.token_yes.as_str(), "111");
        assert_eq!(state.token_no.as_str(), "222");
        assert_eq!(state.symbol, "btc");
    }

    #[test]
    fn gamma_event_without_tokens_is_none() {
        let events: Vec<GammaEvent> = serde_json::from_str(
            r#"[{"slug": "x", "markets": [{"conditionId": "0xc0ffee", "clobTokenIds": "[\"111\"]"}]}]"#,
        )
        .unwrap();
        assert!(market_state_from_events(events).is_none());
        assert!(market_state_from_events(Vec::new()).is_none());
    }

    #[test]
    fn rewards_market_keeps_extra_fields() {
        let market: RewardsMarket = serde_json::from_str(
            r#"{"condition_id": "0xc0ffee", "question": "q", "rewards_max_spread": 3.5}"#,
        )
        .unwrap();
        assert_eq!(market.condition_id, "0xc0ffee");
        assert!(market.extra.contains_key("rewards_max_spread"));
    }
}
