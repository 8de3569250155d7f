//! Feature engine
//!
//! Turns an ordered price series into a feature table with one row per input
//! point. All rolling features are trailing-only; rows before a window fills
//! use fixed fallbacks (std -> 0, mean -> current value).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::indicators::{pct_change, rolling_std, rsi, sma};
use crate::{FeatureRow, PricePoint, Regime};

pub const VOLATILITY_WINDOW: usize = 7;
pub const SHORT_MA_WINDOW: usize = 7;
pub const LONG_MA_WINDOW: usize = 30;
pub const RSI_PERIOD: usize = 14;

/// Compute the feature table for a price series
///
/// Regimes are left NEUTRAL here; [`crate::regime::classify_regimes`] labels
/// them.
pub fn compute_features(series: &[PricePoint]) -> PipelineResult<Vec<FeatureRow>> {
    if series.len() < 2 {
        return Err(PipelineError::InsufficientData {
            needed: 2,
            available: series.len(),
        });
    }

    let prices: Vec<f64> = series.iter().map(|p| p.price).collect();
    let returns = pct_change(&prices);
    let volatility = rolling_std(&returns, VOLATILITY_WINDOW);
    let ma7 = sma(&prices, SHORT_MA_WINDOW);
    let ma30 = sma(&prices, LONG_MA_WINDOW);
    let rsi_values = rsi(&prices, RSI_PERIOD);

    let volume_features = volume_features(series);

    let rows: Vec<FeatureRow> = series
        .iter()
        .enumerate()
        .map(|(i, point)| {
            let price_ma7 = ma7[i].unwrap_or(point.price);
            let price_ma30 = ma30[i].unwrap_or(point.price);
            let momentum = momentum(point.price, price_ma7);
            let (volume_change, volume_ma7, volume_momentum) = match &volume_features {
                Some(v) => (Some(v.change[i]), Some(v.ma7[i]), Some(v.momentum[i])),
                None => (None, None, None),
            };

            FeatureRow {
                timestamp: point.timestamp,
                price: point.price,
                volume: point.volume,
                market_cap: point.market_cap,
                returns: returns[i],
                volatility: volatility[i].unwrap_or(0.0),
                price_ma7,
                price_ma30,
                momentum,
                rsi: rsi_values[i],
                market_regime: Regime::Neutral,
                volume_change,
                volume_ma7,
                volume_momentum,
            }
        })
        .collect();

    debug!(
        "Computed {} feature rows (volume features: {})",
        rows.len(),
        volume_features.is_some()
    );

    Ok(rows)
}

fn momentum(value: f64, average: f64) -> f64 {
    if average == 0.0 {
        0.0
    } else {
        (value / average - 1.0) * 100.0
    }
}

struct VolumeFeatures {
    change: Vec<f64>,
    ma7: Vec<f64>,
    momentum: Vec<f64>,
}

/// Volume features mirror the price features; only computed when every point
/// carries a volume.
fn volume_features(series: &[PricePoint]) -> Option<VolumeFeatures> {
    let volumes: Vec<f64> = series.iter().map(|p| p.volume).collect::<Option<Vec<_>>>()?;

    let change = pct_change(&volumes);
    let ma7: Vec<f64> = sma(&volumes, SHORT_MA_WINDOW)
        .into_iter()
        .zip(volumes.iter())
        .map(|(avg, &v)| avg.unwrap_or(v))
        .collect();
    let momentum = volumes
        .iter()
        .zip(ma7.iter())
        .map(|(&v, &avg)| momentum(v, avg))
        .collect();

    Some(VolumeFeatures {
        change,
        ma7,
        momentum,
    })
}

/// A named numeric column of the feature table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureColumn {
    Price,
    Returns,
    Volatility,
    PriceMa7,
    PriceMa30,
    Momentum,
    Rsi,
    MarketRegime,
    Volume,
    VolumeChange,
    VolumeMa7,
    VolumeMomentum,
    MarketCap,
}

impl FeatureColumn {
    pub const CORE: [FeatureColumn; 8] = [
        FeatureColumn::Price,
        FeatureColumn::Returns,
        FeatureColumn::Volatility,
        FeatureColumn::PriceMa7,
        FeatureColumn::PriceMa30,
        FeatureColumn::Momentum,
        FeatureColumn::Rsi,
        FeatureColumn::MarketRegime,
    ];

    pub const VOLUME: [FeatureColumn; 4] = [
        FeatureColumn::Volume,
        FeatureColumn::VolumeChange,
        FeatureColumn::VolumeMa7,
        FeatureColumn::VolumeMomentum,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FeatureColumn::Price => "price",
            FeatureColumn::Returns => "returns",
            FeatureColumn::Volatility => "volatility",
            FeatureColumn::PriceMa7 => "price_ma7",
            FeatureColumn::PriceMa30 => "price_ma30",
            FeatureColumn::Momentum => "momentum",
            FeatureColumn::Rsi => "rsi",
            FeatureColumn::MarketRegime => "market_regime",
            FeatureColumn::Volume => "volume",
            FeatureColumn::VolumeChange => "volume_change",
            FeatureColumn::VolumeMa7 => "volume_ma7",
            FeatureColumn::VolumeMomentum => "volume_momentum",
            FeatureColumn::MarketCap => "market_cap",
        }
    }

    /// Read this column from a row; `None` when the row lacks the optional field
    pub fn value(self, row: &FeatureRow) -> Option<f64> {
        match self {
            FeatureColumn::Price => Some(row.price),
            FeatureColumn::Returns => Some(row.returns),
            FeatureColumn::Volatility => Some(row.volatility),
            FeatureColumn::PriceMa7 => Some(row.price_ma7),
            FeatureColumn::PriceMa30 => Some(row.price_ma30),
            FeatureColumn::Momentum => Some(row.momentum),
            FeatureColumn::Rsi => Some(row.rsi),
            FeatureColumn::MarketRegime => Some(row.market_regime.code() as f64),
            FeatureColumn::Volume => row.volume,
            FeatureColumn::VolumeChange => row.volume_change,
            FeatureColumn::VolumeMa7 => row.volume_ma7,
            FeatureColumn::VolumeMomentum => row.volume_momentum,
            FeatureColumn::MarketCap => row.market_cap,
        }
    }
}

/// Ordered set of columns fed to the predictor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn new(columns: Vec<FeatureColumn>) -> Self {
        Self { columns }
    }

    /// Schema of a feature table: core columns, plus volume and market cap
    /// columns when every row carries them
    pub fn for_table(rows: &[FeatureRow]) -> Self {
        let mut columns = FeatureColumn::CORE.to_vec();

        if !rows.is_empty() && rows.iter().all(|r| r.volume_momentum.is_some()) {
            columns.extend_from_slice(&FeatureColumn::VOLUME);
        }
        if !rows.is_empty() && rows.iter().all(|r| r.market_cap.is_some()) {
            columns.push(FeatureColumn::MarketCap);
        }

        Self { columns }
    }

    pub fn columns(&self) -> &[FeatureColumn] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name()).collect()
    }

    /// SHA-256 over the ordered column names
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.names().join(",").as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Extract the feature matrix (rows x columns) for this schema
    pub fn matrix(&self, rows: &[FeatureRow]) -> PipelineResult<Vec<Vec<f64>>> {
        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                self.columns
                    .iter()
                    .map(|&col| {
                        col.value(row).ok_or_else(|| {
                            PipelineError::InvalidSeries(format!(
                                "row {} has no value for column {}",
                                i,
                                col.name()
                            ))
                        })
                    })
                    .collect()
            })
            .collect()
    }
}
