//! Builds and signs a dummy order.
//!
//! Required environment variables (a `.env` file works too):
//! - `PRIVATE_KEY`

use polymarket_client::{to_wei, Config, OrderData, OrderSide, OrderSigner};
use rust_decimal::Decimal;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let Ok(private_key) = std::env::var("PRIVATE_KEY") else {
        println!("PRIVATE_KEY not set; skipping signing demo.");
        return Ok(());
    };

    let config = Config::default();
    let signer = OrderSigner::new(&private_key, config.chain_id)?;
    println!("Address: {}", signer.address());

    let mut order = OrderData::new("1234567890", OrderSide::Buy);
    order.maker = signer.address().to_string();
    order.maker_amount = to_wei(Decimal::ONE, 6)?; // $1
    order.taker_amount = to_wei(Decimal::TWO, 6)?; // 2 shares

    let signed = signer.sign_order(order, &config.exchange_address)?;
    println!("Salt: {}", signed.order.salt);
    println!("Signature: {}...", &signed.signature[..20]);
    println!("Payload: {}", serde_json::to_string_pretty(&signed)?);
    Ok(())
}
