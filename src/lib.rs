pub mod book_manager;
pub mod config;
pub mod eip712;
pub mod errors;
pub mod market_fetcher;
pub mod orderbook;
pub mod signer;
pub mod types;
pub mod ws_client;

pub use book_manager::{
    ArbOpportunityCallback, LastTradeCallback, LiveMarketState, OrderbookManager,
    OrderbookUpdateCallback, Statistics,
};
pub use config::Config;
pub use errors::{ClientError, Result as ClientResult, SignerError, WsClientError, WsResult};
pub use market_fetcher::{LastTradeQuote, MarketFetcher, RewardsMarket};
pub use orderbook::{BookError, BookStore, LevelChange, Orderbook, PriceLevel, Side};
pub use signer::{
    generate_salt, to_wei, OrderData, OrderSide, OrderSigner, SignatureType, SignedOrder,
};
pub use types::{ClobMarket, ConditionId, MarketState, Token, TokenId};
pub use ws_client::{
    BookSnapshot, CloseFrameInfo, ExponentialBackoff, LastTrade, PriceChangeSet, TickSizeChange,
    WsClient, WsConfig, WsConnection, WsEvent, WsState,
};
