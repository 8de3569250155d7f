//! Read commands over the last completed run

use anyhow::Result;
use regime_signals::Availability;

use super::{build_service, load_config, print_report};

const NOT_YET_AVAILABLE: &str = "Not yet available: no pipeline run has completed.";

pub fn signals(config_path: String, limit: usize) -> Result<()> {
    let service = build_service(load_config(&config_path)?)?;

    let Availability::Available(view) = service.signals(limit) else {
        println!("{}", NOT_YET_AVAILABLE);
        return Ok(());
    };

    println!("\n{}", "=".repeat(60));
    println!("RECENT SIGNALS");
    println!("{}", "=".repeat(60));
    println!(
        "BUY {} | SELL {} | HOLD {}",
        view.counts.buy, view.counts.sell, view.counts.hold
    );
    if let Some(threshold) = view.final_threshold {
        println!("Final threshold: {:.6}", threshold);
    }
    println!("{}", "-".repeat(60));
    println!(
        "{:<12} {:>14} {:>6} {:>12} {:>10}",
        "Date", "Price", "Signal", "Predicted", "Confidence"
    );
    for s in &view.signals {
        println!(
            "{:<12} {:>14.2} {:>6} {:>11.4}% {:>10.2}",
            s.timestamp.format("%Y-%m-%d"),
            s.price.unwrap_or_default(),
            s.signal.to_string(),
            s.predicted_return.unwrap_or_default() * 100.0,
            s.confidence
        );
    }
    Ok(())
}

pub fn performance(config_path: String) -> Result<()> {
    let config = load_config(&config_path)?;
    let service = build_service(config.clone())?;

    match service.performance() {
        Availability::Available(report) => print_report(&report, &config),
        Availability::NotYetAvailable => println!("{}", NOT_YET_AVAILABLE),
    }
    Ok(())
}

pub fn regimes(config_path: String, limit: usize) -> Result<()> {
    let service = build_service(load_config(&config_path)?)?;

    let Availability::Available(view) = service.regimes() else {
        println!("{}", NOT_YET_AVAILABLE);
        return Ok(());
    };

    println!("\n{}", "=".repeat(60));
    println!("MARKET REGIMES ({:?} rule)", view.variant);
    println!("{}", "=".repeat(60));
    for (label, count) in &view.counts {
        println!("{:<10} {}", label, count);
    }
    println!("{}", "-".repeat(60));
    let skip = view.regimes.len().saturating_sub(limit);
    for point in view.regimes.iter().skip(skip) {
        println!(
            "{:<12} {} ({})",
            point.timestamp.format("%Y-%m-%d"),
            point.regime,
            point.regime.code()
        );
    }
    Ok(())
}
