use std::{fs, path::Path};

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::errors::Result;

/// Client configuration. Every field has a production default so partial
/// TOML files (or `Config::default()`) are enough to get started.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base URL for the CLOB REST API.
    #[serde(default = "default_clob_rest_url")]
    pub clob_rest_url: String,
    /// Base URL for the Gamma metadata API.
    #[serde(default = "default_gamma_api_url")]
    pub gamma_api_url: String,
    /// Market-channel websocket URL.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Per-request HTTP timeout.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    /// Keepalive ping cadence; two missed pongs close the connection.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Per-side level cap; worse levels beyond this are evicted.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Combined best-bid level at which the arb callback fires.
    #[serde(default = "default_arb_threshold")]
    pub arb_threshold: Decimal,
    /// Re-arm band below the threshold, suppressing callback storms.
    #[serde(default = "default_arb_hysteresis")]
    pub arb_hysteresis: Decimal,
    /// Chain id for the EIP-712 signing domain (137 = Polygon mainnet).
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    /// Verifying contract for the signing domain.
    #[serde(default = "default_exchange_address")]
    pub exchange_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clob_rest_url: default_clob_rest_url(),
            gamma_api_url: default_gamma_api_url(),
            ws_url: default_ws_url(),
            http_timeout_ms: default_http_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            auto_reconnect: true,
            max_depth: default_max_depth(),
            arb_threshold: default_arb_threshold(),
            arb_hysteresis: default_arb_hysteresis(),
            chain_id: default_chain_id(),
            exchange_address: default_exchange_address(),
        }
    }
}

impl Config {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(crate::errors::ClientError::InvalidConfig {
                field: "max_depth",
                why: "must be at least 1",
            });
        }
        if self.arb_hysteresis.is_sign_negative() {
            return Err(crate::errors::ClientError::InvalidConfig {
                field: "arb_hysteresis",
                why: "must be non-negative",
            });
        }
        Ok(())
    }
}

fn default_clob_rest_url() -> String {
    "https://clob.polymarket.com".to_string()
}

fn default_gamma_api_url() -> String {
    "https://gamma-api.polymarket.com".to_string()
}

fn default_ws_url() -> String {
    "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

fn default_ping_interval_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_max_depth() -> usize {
    100
}

fn default_arb_threshold() -> Decimal {
    Decimal::ONE
}

fn default_arb_hysteresis() -> Decimal {
    // 0.002 in settlement units
    Decimal::new(2, 3)
}

fn default_chain_id() -> u64 {
    137
}

fn default_exchange_address() -> String {
    // Polymarket CTF Exchange on Polygon
    "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E".to_string()
}
