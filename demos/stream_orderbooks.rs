//! Streams live orderbooks for the first few binary markets and reports
//! arbitrage edges on the combined best bid.
//!
//! Optional environment variables:
//! - `POLYMARKET_CLOB_URL`, `POLYMARKET_WS_URL`
//! - `POLYMARKET_MARKETS` (how many markets to stream, default 3)

use std::time::Duration;

use polymarket_client::{Config, MarketFetcher, OrderbookManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut config = Config::default();
    if let Ok(url) = std::env::var("POLYMARKET_CLOB_URL") {
        config.clob_rest_url = url;
    }
    if let Ok(url) = std::env::var("POLYMARKET_WS_URL") {
        config.ws_url = url;
    }
    let count: usize = std::env::var("POLYMARKET_MARKETS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(3);

    let fetcher = MarketFetcher::new(&config)?;
    let markets = fetcher.fetch_binary_markets(count).await?;
    println!("Streaming {} markets", markets.len());

    let manager = OrderbookManager::new(config)?;
    for market in &markets {
        let state = MarketFetcher::to_market_state(market);
        println!("  {} ({})", state.slug, state.condition_id);
        manager.subscribe(&state)?;
    }

    manager.on_orderbook_update(|token, book| {
        println!(
            "book {}: bid {:?} ask {:?} ({} levels)",
            token,
            book.best_bid(),
            book.best_ask(),
            book.bids.len() + book.asks.len()
        );
    });
    manager.on_arb_opportunity(|market, combined| {
        println!("ARB {}: combined best bid {combined}", market.slug);
    });

    manager.connect().await?;
    println!("Connected; streaming for 30 seconds...");
    tokio::time::sleep(Duration::from_secs(30)).await;

    manager.disconnect().await;
    let stats = manager.statistics();
    println!(
        "Done: {} updates, {} messages, {} bytes, {} resyncs, {} arbs",
        stats.total_updates,
        stats.messages_received,
        stats.bytes_received,
        stats.resyncs,
        stats.arb_opportunities
    );
    Ok(())
}
