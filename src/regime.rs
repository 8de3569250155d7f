//! Market regime classification
//!
//! Labels each feature row NEUTRAL, BULLISH or BEARISH. Two rules are
//! available, selected by [`RegimeVariant`]:
//!
//! - `Simple`: trailing mean of returns over `lookback` rows against
//!   `±return_threshold`.
//! - `IndicatorConfirmed`: short MA vs long MA direction, sign of the trailing
//!   returns mean and RSI on the same side of 50 must all agree; rows inside the
//!   warmup stay NEUTRAL.
//!
//! The label only feeds confidence adjustment downstream, never signal
//! direction.

use std::collections::BTreeMap;
use tracing::debug;

use crate::config::{RegimeConfig, RegimeVariant};
use crate::indicators::sma;
use crate::{FeatureRow, Regime};

/// Regime classifier
#[derive(Debug, Clone)]
pub struct RegimeClassifier {
    config: RegimeConfig,
}

impl RegimeClassifier {
    pub fn new(config: RegimeConfig) -> Self {
        RegimeClassifier { config }
    }

    /// Active rule
    pub fn variant(&self) -> RegimeVariant {
        self.config.variant
    }

    /// Return a copy of `features` with `market_regime` assigned per row
    pub fn classify(&self, features: &[FeatureRow]) -> Vec<FeatureRow> {
        let returns: Vec<f64> = features.iter().map(|r| r.returns).collect();
        let lookback = self.config.lookback.max(1);
        let returns_mean = sma(&returns, lookback);

        let labeled: Vec<FeatureRow> = features
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let regime = match self.config.variant {
                    RegimeVariant::Simple => self.simple(returns_mean[i]),
                    RegimeVariant::IndicatorConfirmed => {
                        self.indicator_confirmed(i, row, returns_mean[i])
                    }
                };
                FeatureRow {
                    market_regime: regime,
                    ..row.clone()
                }
            })
            .collect();

        debug!(
            "Classified {} rows with {:?} rule: {:?}",
            labeled.len(),
            self.config.variant,
            regime_counts(&labeled)
        );

        labeled
    }

    fn simple(&self, returns_mean: Option<f64>) -> Regime {
        match returns_mean {
            Some(m) if m > self.config.return_threshold => Regime::Bullish,
            Some(m) if m < -self.config.return_threshold => Regime::Bearish,
            _ => Regime::Neutral,
        }
    }

    fn indicator_confirmed(&self, index: usize, row: &FeatureRow, returns_mean: Option<f64>) -> Regime {
        if index < self.config.warmup_rows {
            return Regime::Neutral;
        }
        let Some(mean) = returns_mean else {
            return Regime::Neutral;
        };

        if row.price_ma7 > row.price_ma30 && mean > 0.0 && row.rsi > 50.0 {
            Regime::Bullish
        } else if row.price_ma7 < row.price_ma30 && mean < 0.0 && row.rsi < 50.0 {
            Regime::Bearish
        } else {
            Regime::Neutral
        }
    }
}

/// Label with the default rule
pub fn classify_regimes(features: &[FeatureRow]) -> Vec<FeatureRow> {
    RegimeClassifier::new(RegimeConfig::default()).classify(features)
}

/// Count rows per regime; every regime is present in the map
pub fn regime_counts(rows: &[FeatureRow]) -> BTreeMap<Regime, usize> {
    let mut counts: BTreeMap<Regime, usize> = Regime::ALL.iter().map(|&r| (r, 0)).collect();
    for row in rows {
        *counts.entry(row.market_regime).or_insert(0) += 1;
    }
    counts
}
