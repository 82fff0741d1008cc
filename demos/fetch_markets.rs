//! Fetches the first page of binary markets and prints the top of book for
//! the first one.
//!
//! Optional environment variables:
//! - `POLYMARKET_CLOB_URL`

use polymarket_client::{Config, MarketFetcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut config = Config::default();
    if let Ok(url) = std::env::var("POLYMARKET_CLOB_URL") {
        config.clob_rest_url = url;
    }

    let fetcher = MarketFetcher::new(&config)?;

    let time = fetcher.server_time().await?;
    println!("Server time: {time}");

    let markets = fetcher.fetch_binary_markets(20).await?;
    println!("Fetched {} binary markets", markets.len());

    let Some(market) = markets.first() else {
        return Ok(());
    };
    println!(
        "First market: {} ({})",
        market.market_slug, market.condition_id
    );

    if let Some(token_yes) = market.token_yes() {
        if let Some(book) = fetcher.fetch_orderbook(token_yes).await? {
            println!(
                "YES book: best bid {:?}, best ask {:?}, {} bid levels",
                book.best_bid(),
                book.best_ask(),
                book.bids.len()
            );
        }
        if let Some(mid) = fetcher.midpoint(token_yes).await? {
            println!("YES midpoint: {mid}");
        }
        if let Some(tick) = fetcher.tick_size(token_yes).await? {
            println!("YES tick size: {tick}");
        }
    }

    Ok(())
}
