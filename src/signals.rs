//! Signal generation
//!
//! Slides a window over the scaled feature table, asks the predictor for a
//! next-period return per window, maps predictions to BUY/SELL/HOLD through a
//! threshold, adjusts confidence by regime and, when too few rows carry an
//! active signal, shrinks the threshold until the minimum rate is reached.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::config::SignalConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::features::FeatureSchema;
use crate::predictor::{FittedModel, Predictor};
use crate::{FeatureRow, Regime, Signal, SignalCounts, SignalRow};

/// Confidence multiplier when the signal agrees with the regime
pub const REGIME_AGREEMENT_BOOST: f64 = 1.2;
/// Confidence multiplier for any signal in a neutral regime
pub const NEUTRAL_REGIME_DAMPING: f64 = 0.9;

/// Map a predicted return to a signal
pub fn classify(predicted_return: f64, threshold: f64) -> Signal {
    if predicted_return > threshold {
        Signal::Buy
    } else if predicted_return < -threshold {
        Signal::Sell
    } else {
        Signal::Hold
    }
}

/// `|predicted_return| × 100`, adjusted for the regime
pub fn confidence(predicted_return: f64, signal: Signal, regime: Regime) -> f64 {
    let base = predicted_return.abs() * 100.0;
    match (signal, regime) {
        (Signal::Buy, Regime::Bullish) | (Signal::Sell, Regime::Bearish) => {
            base * REGIME_AGREEMENT_BOOST
        }
        (_, Regime::Neutral) => base * NEUTRAL_REGIME_DAMPING,
        _ => base,
    }
}

/// Output of one generation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSet {
    /// One row per window end, in timestamp order
    pub rows: Vec<SignalRow>,
    /// Length of the feature table the windows were drawn from
    pub total_rows: usize,
    pub initial_threshold: f64,
    pub final_threshold: f64,
    /// Threshold reductions applied by the rate search
    pub threshold_attempts: usize,
}

impl SignalSet {
    /// Active signals over the full feature table length
    pub fn signal_rate(&self) -> f64 {
        signal_rate(&self.rows, self.total_rows)
    }

    pub fn counts(&self) -> SignalCounts {
        SignalCounts::from_rows(&self.rows)
    }

    /// Expand to one row per feature row
    ///
    /// Rows without window coverage become HOLD with zero confidence and no
    /// prediction. Fails with `MissingSignalColumn` when a signal timestamp is
    /// absent from `features`.
    pub fn timeline(&self, features: &[FeatureRow]) -> PipelineResult<Vec<SignalRow>> {
        let by_timestamp: HashMap<_, &SignalRow> =
            self.rows.iter().map(|r| (r.timestamp, r)).collect();

        let known: HashSet<_> = features.iter().map(|f| f.timestamp).collect();

        if features.len() != self.total_rows || self.rows.iter().any(|r| !known.contains(&r.timestamp)) {
            return Err(PipelineError::MissingSignalColumn);
        }

        Ok(features
            .iter()
            .map(|f| match by_timestamp.get(&f.timestamp) {
                Some(row) => (*row).clone(),
                None => hold_row(f),
            })
            .collect())
    }
}

/// HOLD row for a feature row without a prediction
pub fn hold_row(row: &FeatureRow) -> SignalRow {
    SignalRow {
        timestamp: row.timestamp,
        price: Some(row.price),
        predicted_return: None,
        signal: Signal::Hold,
        confidence: 0.0,
        market_regime: row.market_regime,
    }
}

/// Safe default: every feature row HOLD
pub fn hold_timeline(features: &[FeatureRow]) -> Vec<SignalRow> {
    features.iter().map(hold_row).collect()
}

fn signal_rate(rows: &[SignalRow], total_rows: usize) -> f64 {
    if total_rows == 0 {
        return 0.0;
    }
    rows.iter().filter(|r| r.signal.is_active()).count() as f64 / total_rows as f64
}

/// Signal generator
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    config: SignalConfig,
}

impl SignalGenerator {
    pub fn new(config: SignalConfig) -> Self {
        SignalGenerator { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Generate signals with the configured window size and starting threshold
    pub fn generate<P: Predictor>(
        &self,
        features: &[FeatureRow],
        model: Option<&FittedModel<P>>,
    ) -> PipelineResult<SignalSet> {
        self.generate_with(
            features,
            model,
            self.config.window_size,
            self.config.initial_threshold,
        )
    }

    /// Generate signals for an explicit window size and starting threshold
    pub fn generate_with<P: Predictor>(
        &self,
        features: &[FeatureRow],
        model: Option<&FittedModel<P>>,
        window_size: usize,
        threshold: f64,
    ) -> PipelineResult<SignalSet> {
        let model = model
            .ok_or_else(|| PipelineError::ModelUnavailable("no fitted predictor".into()))?;
        if !model.is_ready() {
            return Err(PipelineError::ModelUnavailable(
                "predictor or scaler is not fitted".into(),
            ));
        }
        if window_size == 0 || features.len() < window_size {
            return Err(PipelineError::InsufficientData {
                needed: window_size.max(1),
                available: features.len(),
            });
        }

        let schema = FeatureSchema::for_table(features);
        if !model.is_compatible(&schema) {
            return Err(PipelineError::CacheSchemaMismatch {
                expected: model.schema.names().join(","),
                found: schema.names().join(","),
            });
        }

        let scaled = model.scaler.transform(&schema.matrix(features)?)?;

        // Windows are independent and the predictor is read-only; collect keeps
        // index order.
        let predictions: Vec<f64> = (window_size - 1..features.len())
            .into_par_iter()
            .map(|end| model.predictor.predict_return(&scaled[end + 1 - window_size..=end]))
            .collect::<PipelineResult<Vec<f64>>>()?;

        let mut rows: Vec<SignalRow> = predictions
            .iter()
            .zip(&features[window_size - 1..])
            .map(|(&predicted, feature)| {
                let signal = classify(predicted, threshold);
                SignalRow {
                    timestamp: feature.timestamp,
                    price: Some(feature.price),
                    predicted_return: Some(predicted),
                    signal,
                    confidence: confidence(predicted, signal, feature.market_regime),
                    market_regime: feature.market_regime,
                }
            })
            .collect();

        let (final_threshold, attempts) =
            self.search_threshold(&mut rows, features.len(), threshold);

        let set = SignalSet {
            rows,
            total_rows: features.len(),
            initial_threshold: threshold,
            final_threshold,
            threshold_attempts: attempts,
        };
        let counts = set.counts();
        info!(
            "Generated {} active signals (BUY {}, SELL {}) over {} rows ({:.2}%), threshold {:.6}",
            counts.active(),
            counts.buy,
            counts.sell,
            set.total_rows,
            set.signal_rate() * 100.0,
            set.final_threshold
        );

        Ok(set)
    }

    /// Shrink the threshold until the active-signal rate reaches the floor
    ///
    /// Only the signal column is re-derived; predictions and confidences stay.
    /// Returns the final threshold and the number of reductions applied.
    fn search_threshold(&self, rows: &mut [SignalRow], total_rows: usize, threshold: f64) -> (f64, usize) {
        let mut rate = signal_rate(rows, total_rows);
        if rate >= self.config.min_signal_rate || total_rows <= self.config.min_rows_for_search {
            return (threshold, 0);
        }

        info!(
            "Signal rate {:.2}% below target {:.2}%, adjusting threshold",
            rate * 100.0,
            self.config.min_signal_rate * 100.0
        );

        let mut adjusted = threshold;
        let mut attempts = 0;
        while rate < self.config.min_signal_rate && attempts < self.config.max_threshold_attempts {
            adjusted *= self.config.threshold_decay;
            for row in rows.iter_mut() {
                if let Some(predicted) = row.predicted_return {
                    row.signal = classify(predicted, adjusted);
                }
            }
            rate = signal_rate(rows, total_rows);
            attempts += 1;
            debug!(
                "Threshold attempt {}: {:.6} -> rate {:.2}%",
                attempts,
                adjusted,
                rate * 100.0
            );
        }

        info!(
            "Adjusted threshold to {:.6} after {} attempts, rate {:.2}%",
            adjusted,
            attempts,
            rate * 100.0
        );
        (adjusted, attempts)
    }
}
