//! Run command implementation

use anyhow::Result;
use regime_signals::config::{DataSourceKind, RegimeVariant};
use tracing::info;

use super::{build_service, load_config, print_report};

pub fn run(
    config_path: String,
    csv_override: Option<String>,
    threshold_override: Option<f64>,
    confirmed_regimes: bool,
) -> Result<()> {
    info!("Starting pipeline run");

    let mut config = load_config(&config_path)?;

    if let Some(csv) = csv_override {
        info!("Overriding price source to CSV: {}", csv);
        config.data.source = DataSourceKind::Csv;
        config.data.csv_path = csv;
    }

    if let Some(threshold) = threshold_override {
        info!("Overriding initial threshold to: {}", threshold);
        config.signals.initial_threshold = threshold;
    }

    if confirmed_regimes {
        info!("Using indicator-confirmed regime rule");
        config.regime.variant = RegimeVariant::IndicatorConfirmed;
    }

    config.validate()?;

    let service = build_service(config.clone())?;
    let snapshot = service.run()?;

    let counts = regime_signals::SignalCounts::from_rows(&snapshot.signals);
    println!("\n{}", "=".repeat(60));
    println!("PIPELINE RUN");
    println!("{}", "=".repeat(60));
    println!("Source:             {}", snapshot.source);
    println!("Rows:               {}", snapshot.features.len());
    println!("Model:              {:?}", snapshot.model_source);
    if let Some(fit) = &snapshot.fit {
        println!(
            "Fit:                {} train / {} validation windows, train MSE {:.3e}",
            fit.train_windows, fit.validation_windows, fit.train_mse
        );
    }
    println!(
        "Signals:            BUY {} | SELL {} | HOLD {}",
        counts.buy, counts.sell, counts.hold
    );
    if let Some(set) = &snapshot.signal_set {
        println!(
            "Threshold:          {:.6} -> {:.6} ({} reductions)",
            set.initial_threshold, set.final_threshold, set.threshold_attempts
        );
    }

    print_report(&snapshot.report, &config);

    Ok(())
}
