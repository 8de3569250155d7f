//! Download command - fetch price history from CoinGecko

use anyhow::Result;
use regime_signals::data::{save_csv, CoinGeckoSource, PriceSource};
use tracing::info;

use super::load_config;

pub fn run(config_path: String, coin: String, days: u32, output: String) -> Result<()> {
    let mut config = load_config(&config_path)?;
    config.data.coin = coin;
    config.data.days = days;

    info!("Starting download of {} ({} days)", config.data.coin, days);

    println!("\n{}", "=".repeat(60));
    println!("DOWNLOADING PRICE HISTORY FROM COINGECKO");
    println!("{}", "=".repeat(60));
    println!("  Coin:     {}", config.data.coin);
    println!("  Currency: {}", config.data.vs_currency);
    println!("  Days:     {}", days);
    println!("  Output:   {}", output);
    println!("{}\n", "=".repeat(60));

    let fetcher = CoinGeckoSource::new(config.data.clone())?;
    let series = fetcher.fetch()?;
    let path = save_csv(&series, &output)?;

    println!("✓ {} points written to {}", series.len(), path.display());
    Ok(())
}
