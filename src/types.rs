//! Core data types used across the signal pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One observation of the input price series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_cap: Option<f64>,
}

impl PricePoint {
    pub fn new(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self {
            timestamp,
            price,
            volume: None,
            market_cap: None,
        }
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_market_cap(mut self, market_cap: f64) -> Self {
        self.market_cap = Some(market_cap);
        self
    }
}

/// Market state label
///
/// Serialized as its numeric code (0 neutral, 1 bullish, 2 bearish).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Regime {
    #[default]
    Neutral,
    Bullish,
    Bearish,
}

impl Regime {
    pub const ALL: [Regime; 3] = [Regime::Neutral, Regime::Bullish, Regime::Bearish];

    pub fn code(self) -> u8 {
        match self {
            Regime::Neutral => 0,
            Regime::Bullish => 1,
            Regime::Bearish => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Regime::Neutral => "Neutral",
            Regime::Bullish => "Bullish",
            Regime::Bearish => "Bearish",
        }
    }

    /// Code-to-label map handed to presentation layers
    pub fn labels() -> BTreeMap<u8, &'static str> {
        Self::ALL.iter().map(|r| (r.code(), r.label())).collect()
    }
}

impl From<Regime> for u8 {
    fn from(regime: Regime) -> Self {
        regime.code()
    }
}

impl TryFrom<u8> for Regime {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Regime::Neutral),
            1 => Ok(Regime::Bullish),
            2 => Ok(Regime::Bearish),
            other => Err(format!("unknown regime code {}", other)),
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Trading signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    #[default]
    Hold,
}

impl Signal {
    /// Position held after acting on this signal: long, short or flat
    pub fn position(self) -> i8 {
        match self {
            Signal::Buy => 1,
            Signal::Sell => -1,
            Signal::Hold => 0,
        }
    }

    pub fn is_active(self) -> bool {
        self != Signal::Hold
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Signal::Buy => "BUY",
            Signal::Sell => "SELL",
            Signal::Hold => "HOLD",
        };
        write!(f, "{}", s)
    }
}

/// One row of the feature table, 1:1 with the input series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub volume: Option<f64>,
    pub market_cap: Option<f64>,
    pub returns: f64,
    pub volatility: f64,
    pub price_ma7: f64,
    pub price_ma30: f64,
    pub momentum: f64,
    pub rsi: f64,
    pub market_regime: Regime,
    pub volume_change: Option<f64>,
    pub volume_ma7: Option<f64>,
    pub volume_momentum: Option<f64>,
}

/// Signal derived for one timestamp
///
/// Rows without window coverage carry no prediction, a HOLD signal and zero
/// confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRow {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub price: Option<f64>,
    pub predicted_return: Option<f64>,
    pub signal: Signal,
    pub confidence: f64,
    pub market_regime: Regime,
}

/// Signal totals by type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalCounts {
    pub buy: usize,
    pub sell: usize,
    pub hold: usize,
}

impl SignalCounts {
    pub fn from_rows(rows: &[SignalRow]) -> Self {
        rows.iter().fold(SignalCounts::default(), |mut acc, row| {
            match row.signal {
                Signal::Buy => acc.buy += 1,
                Signal::Sell => acc.sell += 1,
                Signal::Hold => acc.hold += 1,
            }
            acc
        })
    }

    pub fn active(&self) -> usize {
        self.buy + self.sell
    }

    pub fn total(&self) -> usize {
        self.buy + self.sell + self.hold
    }
}

/// Backtest statistics for one signal series
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub sharpe_ratio: f64,
    /// Fraction, 0.25 = 25% peak-to-trough
    pub max_drawdown: f64,
    /// Fraction of periods with a position change
    pub trade_frequency: f64,
    /// Final cumulative strategy return minus one
    pub total_return: f64,
    pub periods: usize,
    pub meets_sharpe_ratio: bool,
    pub meets_drawdown: bool,
    pub meets_frequency: bool,
    pub meets_criteria: bool,
}

/// Read-side result that is explicit about missing data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum Availability<T> {
    Available(T),
    NotYetAvailable,
}

impl<T> Availability<T> {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Availability::Available(value) => Some(value),
            Availability::NotYetAvailable => None,
        }
    }
}

impl<T> From<Option<T>> for Availability<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Availability::Available(v),
            None => Availability::NotYetAvailable,
        }
    }
}
