use thiserror::Error;

/// Errors produced while constructing or signing orders.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid amount for {field}: {value}")]
    InvalidAmount { field: &'static str, value: String },
    #[error("order signer {signer} does not match key address {address}")]
    SignerMismatch { signer: String, address: String },
    #[error("signing failed: {0}")]
    Signing(String),
}

pub type WsResult<T> = std::result::Result<T, WsClientError>;

/// Errors raised by the websocket transport and the orderbook manager.
#[derive(Debug, Error)]
pub enum WsClientError {
    #[error("no assets subscribed")]
    EmptySubscriptions,
    #[error("not connected")]
    NotConnected,
    #[error("subscription change from inside a callback")]
    Reentrant,
    #[error("invalid websocket message: {0}")]
    InvalidMessage(String),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type used by [`MarketFetcher`](crate::market_fetcher::MarketFetcher)
/// and configuration loading.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors returned by the REST client and configuration helpers.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Non-success HTTP response with the raw body attached.
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    /// Configuration validation failure.
    #[error("invalid config: {field}: {why}")]
    InvalidConfig {
        field: &'static str,
        why: &'static str,
    },
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
