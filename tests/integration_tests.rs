//! Integration tests for the regime-signals pipeline
//!
//! These tests verify that all components work together correctly.

use approx::assert_relative_eq;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::PathBuf;

use regime_signals::config::{ModelConfig, RegimeConfig, RegimeVariant, SignalConfig};
use regime_signals::data::{save_csv, CsvSource, StaticSource};
use regime_signals::evaluate::{Backtest, PerformanceEvaluator};
use regime_signals::features::{compute_features, FeatureSchema};
use regime_signals::pipeline::{ModelSource, Pipeline, PipelineService, RunState};
use regime_signals::predictor::{fit_model, FittedModel, RidgeRegressor};
use regime_signals::regime::{classify_regimes, RegimeClassifier};
use regime_signals::signals::SignalGenerator;
use regime_signals::store::{ModelBundle, ModelStore};
use regime_signals::{
    Availability, Config, FeatureRow, PipelineError, PricePoint, Regime, Signal,
};

// =============================================================================
// Test Utilities
// =============================================================================

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Series with the same price on every row
fn generate_flat_series(count: usize, price: f64) -> Vec<PricePoint> {
    (0..count)
        .map(|i| PricePoint::new(start_time() + Duration::days(i as i64), price))
        .collect()
}

/// Strictly increasing series
fn generate_uptrend_series(count: usize, base_price: f64, step: f64) -> Vec<PricePoint> {
    (0..count)
        .map(|i| {
            PricePoint::new(
                start_time() + Duration::days(i as i64),
                base_price + step * i as f64,
            )
        })
        .collect()
}

/// Oscillating series with a slight drift and volume
fn generate_oscillating_series(count: usize, base_price: f64, amplitude: f64) -> Vec<PricePoint> {
    (0..count)
        .map(|i| {
            let t = i as f64;
            let price = base_price + amplitude * (t * 0.4).sin() + amplitude * 0.3 * (t * 1.3).cos() + t * 0.5;
            PricePoint::new(start_time() + Duration::days(i as i64), price)
                .with_volume(1000.0 + (i as f64 * 10.0) + 50.0 * (t * 0.7).sin())
        })
        .collect()
}

fn labeled_features(series: &[PricePoint]) -> Vec<FeatureRow> {
    classify_regimes(&compute_features(series).unwrap())
}

fn fitted(features: &[FeatureRow]) -> FittedModel {
    fit_model(
        RidgeRegressor::default(),
        features,
        SignalConfig::default().window_size,
        &ModelConfig::default(),
    )
    .unwrap()
    .0
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "regime_signals_it_{}_{}_{}",
        name,
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn store_in(dir: &std::path::Path) -> ModelStore {
    ModelStore::new(dir.join("pipeline_state.db"), dir.join("pipeline_state.json"), true).unwrap()
}

// =============================================================================
// Feature Engine Tests
// =============================================================================

#[test]
fn test_feature_row_count_matches_series() {
    for count in [2, 7, 31, 120] {
        let series = generate_oscillating_series(count, 100.0, 5.0);
        assert_eq!(compute_features(&series).unwrap().len(), count);
    }
}

#[test]
fn test_features_have_no_look_ahead() {
    let series = generate_oscillating_series(60, 100.0, 8.0);
    let full = compute_features(&series).unwrap();

    for i in 1..series.len() {
        let truncated = compute_features(&series[..=i]).unwrap();
        assert_eq!(truncated[i], full[i], "row {} changed when later rows were dropped", i);
    }
}

#[test]
fn test_single_point_is_insufficient() {
    let series = generate_flat_series(1, 100.0);
    assert_eq!(
        compute_features(&series).unwrap_err(),
        PipelineError::InsufficientData {
            needed: 2,
            available: 1
        }
    );
}

#[test]
fn test_flat_series_features_are_well_defined() {
    let features = compute_features(&generate_flat_series(40, 250.0)).unwrap();

    for row in &features {
        assert_eq!(row.returns, 0.0);
        assert_eq!(row.volatility, 0.0);
        assert!(row.rsi.is_finite());
        assert!((0.0..=100.0).contains(&row.rsi));
        assert_eq!(row.momentum, 0.0);
    }
}

#[test]
fn test_volume_extends_schema() {
    let with_volume = compute_features(&generate_oscillating_series(20, 100.0, 2.0)).unwrap();
    let without = compute_features(&generate_uptrend_series(20, 100.0, 1.0)).unwrap();

    let wide = FeatureSchema::for_table(&with_volume);
    let narrow = FeatureSchema::for_table(&without);

    assert_eq!(narrow.len(), 8);
    assert_eq!(wide.len(), 12);
    assert_ne!(wide.fingerprint(), narrow.fingerprint());
}

// =============================================================================
// Regime Classifier Tests
// =============================================================================

#[test]
fn test_uptrend_has_no_bearish_rows_after_warmup() {
    let config = RegimeConfig {
        variant: RegimeVariant::IndicatorConfirmed,
        ..RegimeConfig::default()
    };
    let classifier = RegimeClassifier::new(config);
    let features = compute_features(&generate_uptrend_series(90, 100.0, 1.5)).unwrap();
    let labeled = classifier.classify(&features);

    assert!(labeled[..30].iter().all(|r| r.market_regime == Regime::Neutral));
    assert_eq!(
        labeled[30..]
            .iter()
            .filter(|r| r.market_regime == Regime::Bearish)
            .count(),
        0
    );
}

// =============================================================================
// Signal Generator Tests
// =============================================================================

#[test]
fn test_flat_series_yields_all_hold_and_search_terminates() {
    let features = labeled_features(&generate_flat_series(40, 100.0));
    let model = fitted(&features);
    let generator = SignalGenerator::new(SignalConfig::default());

    let set = generator
        .generate_with(&features, Some(&model), 7, 0.001)
        .unwrap();

    assert_eq!(set.rows.len(), 40 - 7 + 1);
    assert!(set.rows.iter().all(|r| r.signal == Signal::Hold));
    assert_eq!(set.threshold_attempts, 10);
    assert_relative_eq!(set.final_threshold, 0.001 * 0.8f64.powi(10), epsilon = 1e-15);
}

#[test]
fn test_window_sized_series_yields_one_row() {
    let training = labeled_features(&generate_uptrend_series(60, 100.0, 1.0));
    let model = fitted(&training);
    let generator = SignalGenerator::new(SignalConfig::default());

    let exact = labeled_features(&generate_uptrend_series(7, 100.0, 1.0));
    let set = generator.generate(&exact, Some(&model)).unwrap();
    assert_eq!(set.rows.len(), 1);
    assert_eq!(set.rows[0].timestamp, exact[6].timestamp);

    let short = labeled_features(&generate_uptrend_series(6, 100.0, 1.0));
    assert_eq!(
        generator.generate(&short, Some(&model)).unwrap_err(),
        PipelineError::InsufficientData {
            needed: 7,
            available: 6
        }
    );
}

#[test]
fn test_generate_without_model_is_unavailable() {
    let features = labeled_features(&generate_uptrend_series(30, 100.0, 1.0));
    let generator = SignalGenerator::new(SignalConfig::default());

    let err = generator
        .generate::<RidgeRegressor>(&features, None)
        .unwrap_err();
    assert!(matches!(err, PipelineError::ModelUnavailable(_)));
    assert!(err.is_recoverable());
}

#[test]
fn test_generate_rejects_incompatible_schema() {
    let narrow = labeled_features(&generate_uptrend_series(60, 100.0, 1.0));
    let wide = labeled_features(&generate_oscillating_series(60, 100.0, 3.0));
    let model = fitted(&narrow);

    let err = SignalGenerator::new(SignalConfig::default())
        .generate(&wide, Some(&model))
        .unwrap_err();
    assert!(matches!(err, PipelineError::CacheSchemaMismatch { .. }));
}

#[test]
fn test_lower_threshold_never_lowers_signal_rate() {
    let features = labeled_features(&generate_oscillating_series(120, 100.0, 10.0));
    let model = fitted(&features);
    // search disabled so the starting threshold is the one applied
    let generator = SignalGenerator::new(SignalConfig {
        min_signal_rate: 0.0,
        ..SignalConfig::default()
    });

    let mut previous_rate = -1.0;
    for threshold in [0.05, 0.02, 0.01, 0.005, 0.001, 0.0001, 0.0] {
        let set = generator
            .generate_with(&features, Some(&model), 7, threshold)
            .unwrap();
        assert_eq!(set.threshold_attempts, 0);
        assert!(set.signal_rate() >= previous_rate);
        previous_rate = set.signal_rate();
    }
}

#[test]
fn test_generation_is_reproducible() {
    let features = labeled_features(&generate_oscillating_series(90, 100.0, 6.0));
    let model = fitted(&features);
    let generator = SignalGenerator::new(SignalConfig::default());

    let first = generator.generate(&features, Some(&model)).unwrap();
    let second = generator.generate(&features, Some(&model)).unwrap();
    assert_eq!(first, second);
}

// =============================================================================
// Performance Evaluator Tests
// =============================================================================

#[test]
fn test_evaluator_lag_invariant() {
    let features = labeled_features(&generate_oscillating_series(80, 100.0, 12.0));
    let model = fitted(&features);
    let set = SignalGenerator::new(SignalConfig::default())
        .generate(&features, Some(&model))
        .unwrap();
    let timeline = set.timeline(&features).unwrap();
    let backtest = Backtest::from_signals(&timeline).unwrap();

    assert_eq!(backtest.strategy_returns[0], 0.0);
    assert_eq!(backtest.positions[0], 0);
    for i in 1..timeline.len() {
        assert_eq!(backtest.positions[i], timeline[i - 1].signal.position());
    }
}

#[test]
fn test_evaluate_is_idempotent() {
    let features = labeled_features(&generate_oscillating_series(80, 100.0, 12.0));
    let model = fitted(&features);
    let set = SignalGenerator::new(SignalConfig::default())
        .generate(&features, Some(&model))
        .unwrap();
    let timeline = set.timeline(&features).unwrap();
    let evaluator = PerformanceEvaluator::default();

    assert_eq!(
        evaluator.evaluate(&timeline).unwrap(),
        evaluator.evaluate(&timeline).unwrap()
    );
}

#[test]
fn test_metrics_are_reported_unclamped() {
    // long the whole way down a falling market
    let prices = [100.0, 90.0, 80.0, 70.0, 60.0, 50.0];
    let rows: Vec<_> = prices
        .iter()
        .enumerate()
        .map(|(i, &price)| regime_signals::SignalRow {
            timestamp: start_time() + Duration::days(i as i64),
            price: Some(price),
            predicted_return: Some(0.01),
            signal: Signal::Buy,
            confidence: 1.0,
            market_regime: Regime::Neutral,
        })
        .collect();

    let report = PerformanceEvaluator::default().evaluate(&rows).unwrap();
    assert!(report.sharpe_ratio < 0.0);
    assert_relative_eq!(report.max_drawdown, 0.5, epsilon = 1e-12);
    assert!(!report.meets_drawdown);
    assert!(!report.meets_criteria);
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_persisted_bundle_reproduces_signals() {
    let dir = temp_dir("roundtrip");
    let store = store_in(&dir);
    let features = labeled_features(&generate_oscillating_series(100, 100.0, 7.0));
    let model = fitted(&features);
    let generator = SignalGenerator::new(SignalConfig::default());

    let before = generator.generate(&features, Some(&model)).unwrap();
    store.save_bundle(&ModelBundle::new(model, None)).unwrap();

    let reopened = store_in(&dir);
    let bundle: ModelBundle = reopened
        .load_bundle(&FeatureSchema::for_table(&features))
        .unwrap()
        .expect("bundle should match the live schema");
    let after = generator.generate(&features, Some(&bundle.model)).unwrap();

    assert_eq!(before, after);
    std::fs::remove_dir_all(&dir).ok();
}

// =============================================================================
// Pipeline Tests
// =============================================================================

#[test]
fn test_pipeline_end_to_end_with_store() {
    let dir = temp_dir("pipeline");
    let series = generate_oscillating_series(120, 100.0, 9.0);

    let service = PipelineService::new(
        Pipeline::new(Config::default(), Box::new(StaticSource::new(series.clone())))
            .with_store(store_in(&dir)),
    );
    assert_eq!(service.performance(), Availability::NotYetAvailable);

    let first = service.run().unwrap();
    assert_eq!(first.model_source, ModelSource::Fitted);
    assert_eq!(first.signals.len(), series.len());
    assert_eq!(service.status().state, RunState::Done);

    // a fresh process reuses the stored model and sees the last snapshot
    let restarted = PipelineService::new(
        Pipeline::new(Config::default(), Box::new(StaticSource::new(series.clone())))
            .with_store(store_in(&dir)),
    );
    assert!(restarted.restore().unwrap());
    assert_eq!(restarted.performance().into_option(), Some(first.report.clone()));

    let second = restarted.run().unwrap();
    assert_eq!(second.model_source, ModelSource::Memory);
    assert_eq!(second.signals, first.signals);

    // without restore the model comes straight from the store
    let cold = PipelineService::new(
        Pipeline::new(Config::default(), Box::new(StaticSource::new(series)))
            .with_store(store_in(&dir)),
    );
    let third = cold.run().unwrap();
    assert_eq!(third.model_source, ModelSource::Store);
    assert_eq!(third.signals, first.signals);

    let store = store_in(&dir);
    let runs = store.recent_runs(10).unwrap();
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|r| r.state == "DONE"));

    // cache hits refresh the stored report instead of adding bundles
    assert_eq!(store.bundle_count().unwrap(), 1);
    let latest: ModelBundle = store.latest_bundle().unwrap().unwrap();
    assert_eq!(latest.report, Some(third.report.clone()));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_pipeline_reads_from_csv() {
    let dir = temp_dir("csv");
    let csv_path = dir.join("prices.csv");
    save_csv(&generate_oscillating_series(60, 100.0, 4.0), &csv_path).unwrap();

    let service = PipelineService::new(Pipeline::new(
        Config::default(),
        Box::new(CsvSource::new(&csv_path)),
    ));
    let snapshot = service.run().unwrap();

    assert_eq!(snapshot.features.len(), 60);
    assert!(snapshot.source.starts_with("csv:"));
    let signals = service.signals(50).into_option().unwrap();
    assert_eq!(signals.counts.total(), 60);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_pipeline_with_invalid_series_fails_recoverably() {
    let mut series = generate_uptrend_series(40, 100.0, 1.0);
    series.swap(10, 11);

    let service = PipelineService::new(Pipeline::new(
        Config::default(),
        Box::new(StaticSource::new(series)),
    ));
    let err = service.run().unwrap_err();

    assert!(matches!(err, PipelineError::InvalidSeries(_)));
    assert!(err.is_recoverable());
    let status = service.status();
    assert_eq!(status.state, RunState::Failed);
    assert!(!status.task_running);
    assert!(status.last_error.is_some());
    assert_eq!(service.regimes(), Availability::NotYetAvailable);
}
