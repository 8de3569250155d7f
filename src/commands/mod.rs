//! CLI subcommands

pub mod download;
pub mod report;
pub mod run;
pub mod watch;

use anyhow::{Context, Result};
use regime_signals::data::source_from_config;
use regime_signals::pipeline::{Pipeline, PipelineService};
use regime_signals::store::ModelStore;
use regime_signals::{Config, PerformanceReport};
use tracing::info;

/// Load the configuration file, falling back to defaults when it is absent
pub fn load_config(config_path: &str) -> Result<Config> {
    let config = Config::load_or_default(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    info!("Loaded configuration from: {}", config_path);
    Ok(config)
}

/// Pipeline service over the configured source and state directory
pub fn build_service(config: Config) -> Result<PipelineService> {
    let source = source_from_config(&config.data)?;
    let store = ModelStore::from_config(&config.store)?;
    let service = PipelineService::new(Pipeline::new(config, source).with_store(store));

    if service.restore()? {
        info!("Previous run restored from the state store");
    }
    Ok(service)
}

pub fn print_report(report: &PerformanceReport, config: &Config) {
    let mark = |ok: bool| if ok { "✓" } else { "✗" };
    let t = &config.targets;

    println!("\n{}", "=".repeat(60));
    println!("PERFORMANCE REPORT");
    println!("{}", "=".repeat(60));
    println!(
        "Sharpe Ratio:       {:.2}  (target >= {:.2}) {}",
        report.sharpe_ratio,
        t.sharpe_target,
        mark(report.meets_sharpe_ratio)
    );
    println!(
        "Max Drawdown:       {:.2}% (ceiling {:.2}%) {}",
        report.max_drawdown * 100.0,
        t.drawdown_ceiling * 100.0,
        mark(report.meets_drawdown)
    );
    println!(
        "Trade Frequency:    {:.2}% (floor {:.2}%) {}",
        report.trade_frequency * 100.0,
        t.frequency_floor * 100.0,
        mark(report.meets_frequency)
    );
    println!("Total Return:       {:.2}%", report.total_return * 100.0);
    println!("Periods:            {}", report.periods);
    println!(
        "Meets Criteria:     {}",
        if report.meets_criteria { "YES" } else { "NO" }
    );
    println!("{}", "=".repeat(60));
}
