//! Performance evaluation
//!
//! Turns a signal series into lagged positions and scores the resulting
//! strategy: Sharpe ratio, maximum drawdown and trade frequency, each checked
//! against the configured targets. Metrics are reported as computed.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::info;

use crate::config::TargetConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::indicators::pct_change;
use crate::{PerformanceReport, SignalRow};

/// Floor for the standard deviation in the Sharpe ratio
pub const STD_EPSILON: f64 = 1e-10;

/// Per-period backtest series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backtest {
    /// Position realized in each period: the signal of the previous row
    pub positions: Vec<i8>,
    pub period_returns: Vec<f64>,
    pub strategy_returns: Vec<f64>,
    pub cumulative_returns: Vec<f64>,
}

impl Backtest {
    /// Build the backtest series for `signals`
    ///
    /// The position taken on row `i` is realized against the return of row
    /// `i + 1`, so row 0 is always flat.
    pub fn from_signals(signals: &[SignalRow]) -> PipelineResult<Self> {
        if signals.is_empty() {
            return Err(PipelineError::EmptySeries);
        }
        let prices: Vec<f64> = signals
            .iter()
            .map(|s| s.price)
            .collect::<Option<Vec<f64>>>()
            .ok_or(PipelineError::MissingPriceColumn)?;

        let period_returns = pct_change(&prices);

        let positions: Vec<i8> = std::iter::once(0)
            .chain(signals[..signals.len() - 1].iter().map(|s| s.signal.position()))
            .collect();

        let strategy_returns: Vec<f64> = positions
            .iter()
            .zip(period_returns.iter())
            .map(|(&pos, &ret)| pos as f64 * ret)
            .collect();

        let cumulative_returns = strategy_returns
            .iter()
            .scan(1.0, |acc, r| {
                *acc *= 1.0 + r;
                Some(*acc)
            })
            .collect();

        Ok(Backtest {
            positions,
            period_returns,
            strategy_returns,
            cumulative_returns,
        })
    }

    /// Annualized mean/std of strategy returns; 0 when every return is 0
    pub fn sharpe_ratio(&self, periods_per_year: f64) -> f64 {
        if self.strategy_returns.iter().all(|&r| r == 0.0) {
            return 0.0;
        }
        let mean = self.strategy_returns.iter().mean();
        let std = self.strategy_returns.iter().std_dev();
        let std = if std.is_finite() { std.max(STD_EPSILON) } else { STD_EPSILON };
        mean / std * periods_per_year.sqrt()
    }

    /// Largest peak-to-trough decline of the cumulative return, as a fraction
    pub fn max_drawdown(&self) -> f64 {
        let mut peak = f64::NEG_INFINITY;
        let mut max_dd: f64 = 0.0;
        for &value in &self.cumulative_returns {
            peak = peak.max(value);
            if peak > 0.0 {
                max_dd = max_dd.max((1.0 - value / peak).abs());
            }
        }
        max_dd
    }

    /// Position changes between consecutive periods (`i >= 1`) divided by the
    /// number of periods
    pub fn trade_frequency(&self) -> f64 {
        let changes = self
            .positions
            .iter()
            .tuple_windows()
            .filter(|(prev, pos)| prev != pos)
            .count();
        changes as f64 / self.positions.len() as f64
    }

    pub fn total_return(&self) -> f64 {
        self.cumulative_returns.last().map_or(0.0, |c| c - 1.0)
    }
}

/// Scores signal series against fixed targets
#[derive(Debug, Clone, Default)]
pub struct PerformanceEvaluator {
    targets: TargetConfig,
}

impl PerformanceEvaluator {
    pub fn new(targets: TargetConfig) -> Self {
        PerformanceEvaluator { targets }
    }

    /// Evaluate `signals`; pure, same input gives the same report
    pub fn evaluate(&self, signals: &[SignalRow]) -> PipelineResult<PerformanceReport> {
        let backtest = Backtest::from_signals(signals)?;

        let sharpe_ratio = backtest.sharpe_ratio(self.targets.annualization_days);
        let max_drawdown = backtest.max_drawdown();
        let trade_frequency = backtest.trade_frequency();

        let meets_sharpe_ratio = sharpe_ratio >= self.targets.sharpe_target;
        let meets_drawdown = max_drawdown <= self.targets.drawdown_ceiling;
        let meets_frequency = trade_frequency >= self.targets.frequency_floor;

        let report = PerformanceReport {
            sharpe_ratio,
            max_drawdown,
            trade_frequency,
            total_return: backtest.total_return(),
            periods: signals.len(),
            meets_sharpe_ratio,
            meets_drawdown,
            meets_frequency,
            meets_criteria: meets_sharpe_ratio && meets_drawdown && meets_frequency,
        };

        info!(
            "Performance: Sharpe={:.2}, MDD={:.2}%, Freq={:.2}%, meets criteria: {}",
            report.sharpe_ratio,
            report.max_drawdown * 100.0,
            report.trade_frequency * 100.0,
            report.meets_criteria
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Regime, Signal};
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};

    fn rows(prices: &[f64], signals: &[Signal]) -> Vec<SignalRow> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        prices
            .iter()
            .zip(signals.iter())
            .enumerate()
            .map(|(i, (&price, &signal))| SignalRow {
                timestamp: start + Duration::days(i as i64),
                price: Some(price),
                predicted_return: None,
                signal,
                confidence: 0.0,
                market_regime: Regime::Neutral,
            })
            .collect()
    }

    #[test]
    fn test_positions_lag_signals_by_one_row() {
        use Signal::*;
        let series = rows(&[100.0, 110.0, 99.0, 99.0], &[Buy, Sell, Hold, Buy]);
        let backtest = Backtest::from_signals(&series).unwrap();

        assert_eq!(backtest.positions, vec![0, 1, -1, 0]);
        assert_eq!(backtest.strategy_returns[0], 0.0);
        assert_relative_eq!(backtest.strategy_returns[1], 0.1, epsilon = 1e-12);
        assert_relative_eq!(backtest.strategy_returns[2], 0.1, epsilon = 1e-12);
        assert_eq!(backtest.strategy_returns[3], 0.0);
        assert_relative_eq!(backtest.total_return(), 0.21, epsilon = 1e-12);
    }

    #[test]
    fn test_drawdown_and_frequency() {
        use Signal::*;
        // long through +10% then -20%
        let series = rows(&[100.0, 110.0, 88.0, 88.0], &[Buy, Buy, Hold, Hold]);
        let backtest = Backtest::from_signals(&series).unwrap();

        assert_relative_eq!(backtest.max_drawdown(), 0.2, epsilon = 1e-12);
        // positions 0, 1, 1, 0 -> two changes over four periods
        assert_relative_eq!(backtest.trade_frequency(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_frequency_counts_changes_after_first_period() {
        use Signal::*;
        let single = Backtest::from_signals(&rows(&[100.0], &[Sell])).unwrap();
        assert_eq!(single.positions, vec![0]);
        assert_eq!(single.trade_frequency(), 0.0);

        // positions 0, -1, 0 -> two changes over three periods
        let series = rows(&[100.0, 95.0, 96.0], &[Sell, Hold, Hold]);
        let backtest = Backtest::from_signals(&series).unwrap();
        assert_eq!(backtest.positions, vec![0, -1, 0]);
        assert_relative_eq!(backtest.trade_frequency(), 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_all_hold_reports_zero_metrics_honestly() {
        let series = rows(&[100.0, 101.0, 102.0], &[Signal::Hold; 3]);
        let report = PerformanceEvaluator::default().evaluate(&series).unwrap();

        assert_eq!(report.sharpe_ratio, 0.0);
        assert_eq!(report.max_drawdown, 0.0);
        assert_eq!(report.trade_frequency, 0.0);
        assert!(!report.meets_sharpe_ratio);
        assert!(report.meets_drawdown);
        assert!(!report.meets_frequency);
        assert!(!report.meets_criteria);
    }

    #[test]
    fn test_sharpe_matches_sample_statistics() {
        use Signal::*;
        let series = rows(&[100.0, 102.0, 101.0, 104.0], &[Buy, Buy, Buy, Hold]);
        let backtest = Backtest::from_signals(&series).unwrap();

        let r = &backtest.strategy_returns;
        let mean = r.iter().sum::<f64>() / 4.0;
        let var = r.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / 3.0;
        let expected = mean / var.sqrt() * 252f64.sqrt();

        assert_relative_eq!(backtest.sharpe_ratio(252.0), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_errors() {
        let evaluator = PerformanceEvaluator::default();
        assert_eq!(evaluator.evaluate(&[]).unwrap_err(), PipelineError::EmptySeries);

        let mut series = rows(&[100.0, 101.0], &[Signal::Buy, Signal::Hold]);
        series[1].price = None;
        assert_eq!(
            evaluator.evaluate(&series).unwrap_err(),
            PipelineError::MissingPriceColumn
        );
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        use Signal::*;
        let series = rows(&[100.0, 105.0, 95.0, 97.0, 99.0], &[Buy, Sell, Buy, Hold, Sell]);
        let evaluator = PerformanceEvaluator::default();

        assert_eq!(
            evaluator.evaluate(&series).unwrap(),
            evaluator.evaluate(&series).unwrap()
        );
    }
}
