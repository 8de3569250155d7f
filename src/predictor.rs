//! Predictor capability and the reference ridge-regression model
//!
//! Any model that maps a fixed-length window of scaled feature rows to a scalar
//! next-period return can implement [`Predictor`]. The crate ships
//! [`RidgeRegressor`], a closed-form linear model over the flattened window.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::features::FeatureSchema;
use crate::FeatureRow;

/// Singular values below this are treated as zero
const SINGULAR_EPS: f64 = 1e-12;

/// Predicts the next-period return for one window of scaled feature rows
pub trait Predictor: Send + Sync {
    /// Model family name, stored with persisted bundles
    fn name(&self) -> &str;

    fn is_fitted(&self) -> bool;

    /// Fit on windows paired with their target returns
    fn fit(&mut self, windows: &[&[Vec<f64>]], targets: &[f64]) -> PipelineResult<()>;

    /// Predict a scalar return for a window. Read-only: no online learning.
    fn predict_return(&self, window: &[Vec<f64>]) -> PipelineResult<f64>;
}

/// Per-column min-max scaling to [0, 1] over the fit data
///
/// Constant columns map to 0. Inference values outside the fit range are not
/// clipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    mins: Vec<f64>,
    ranges: Vec<f64>,
}

impl MinMaxScaler {
    pub fn fit(matrix: &[Vec<f64>]) -> PipelineResult<Self> {
        let first = matrix.first().ok_or(PipelineError::EmptySeries)?;
        let width = first.len();
        let mut mins = vec![f64::INFINITY; width];
        let mut maxs = vec![f64::NEG_INFINITY; width];

        for row in matrix {
            if row.len() != width {
                return Err(PipelineError::Defect(format!(
                    "ragged feature matrix: expected {} columns, got {}",
                    width,
                    row.len()
                )));
            }
            for (j, &v) in row.iter().enumerate() {
                mins[j] = mins[j].min(v);
                maxs[j] = maxs[j].max(v);
            }
        }

        let ranges = mins
            .iter()
            .zip(maxs.iter())
            .map(|(&lo, &hi)| if hi - lo > 0.0 { hi - lo } else { 1.0 })
            .collect();

        Ok(MinMaxScaler { mins, ranges })
    }

    pub fn is_fitted(&self) -> bool {
        !self.mins.is_empty()
    }

    pub fn width(&self) -> usize {
        self.mins.len()
    }

    pub fn transform(&self, matrix: &[Vec<f64>]) -> PipelineResult<Vec<Vec<f64>>> {
        if !self.is_fitted() {
            return Err(PipelineError::ModelUnavailable("scaler is not fitted".into()));
        }

        matrix
            .iter()
            .map(|row| {
                if row.len() != self.width() {
                    return Err(PipelineError::Defect(format!(
                        "scaler fitted on {} columns, got {}",
                        self.width(),
                        row.len()
                    )));
                }
                Ok(row
                    .iter()
                    .zip(self.mins.iter().zip(self.ranges.iter()))
                    .map(|(&v, (&lo, &range))| (v - lo) / range)
                    .collect())
            })
            .collect()
    }
}

/// Linear model over the flattened window with an unpenalized intercept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeRegressor {
    lambda: f64,
    /// Flattened window weights followed by the intercept
    weights: Vec<f64>,
    window_size: usize,
    width: usize,
}

impl RidgeRegressor {
    pub fn new(lambda: f64) -> Self {
        RidgeRegressor {
            lambda,
            weights: Vec::new(),
            window_size: 0,
            width: 0,
        }
    }

    fn flatten(window: &[Vec<f64>]) -> impl Iterator<Item = f64> + '_ {
        window.iter().flat_map(|row| row.iter().copied())
    }

    fn check_shape(&self, window: &[Vec<f64>]) -> PipelineResult<()> {
        if window.len() != self.window_size || window.iter().any(|r| r.len() != self.width) {
            return Err(PipelineError::Defect(format!(
                "window shape mismatch: model expects {}x{}, got {}x{}",
                self.window_size,
                self.width,
                window.len(),
                window.first().map_or(0, |r| r.len())
            )));
        }
        Ok(())
    }
}

impl Default for RidgeRegressor {
    fn default() -> Self {
        Self::new(ModelConfig::default().ridge_lambda)
    }
}

impl Predictor for RidgeRegressor {
    fn name(&self) -> &str {
        "ridge"
    }

    fn is_fitted(&self) -> bool {
        !self.weights.is_empty()
    }

    fn fit(&mut self, windows: &[&[Vec<f64>]], targets: &[f64]) -> PipelineResult<()> {
        let first = windows.first().ok_or(PipelineError::EmptySeries)?;
        if windows.len() != targets.len() {
            return Err(PipelineError::Defect(format!(
                "{} windows but {} targets",
                windows.len(),
                targets.len()
            )));
        }

        self.window_size = first.len();
        self.width = first.first().map_or(0, |r| r.len());
        for window in windows {
            self.check_shape(window)?;
        }

        let dim = self.window_size * self.width + 1;
        let intercept = dim - 1;
        let x = DMatrix::from_fn(windows.len(), dim, |i, j| {
            if j == intercept {
                1.0
            } else {
                windows[i][j / self.width][j % self.width]
            }
        });
        let y = DVector::from_column_slice(targets);

        // Normal equations: (X'X + lambda I) w = X'y, intercept not penalized
        let mut penalty = DVector::from_element(dim, self.lambda);
        penalty[intercept] = 0.0;
        let gram = x.transpose() * &x + DMatrix::from_diagonal(&penalty);
        let rhs = x.transpose() * &y;

        self.weights = solve(gram, &rhs)?.iter().copied().collect();
        debug!(
            "Ridge fitted: {} windows, {} weights, lambda={}",
            windows.len(),
            self.weights.len(),
            self.lambda
        );
        Ok(())
    }

    fn predict_return(&self, window: &[Vec<f64>]) -> PipelineResult<f64> {
        if !self.is_fitted() {
            return Err(PipelineError::ModelUnavailable("predictor is not fitted".into()));
        }
        self.check_shape(window)?;

        let (intercept, coefs) = self
            .weights
            .split_last()
            .ok_or_else(|| PipelineError::Defect("empty weight vector".into()))?;
        let prediction = intercept
            + coefs
                .iter()
                .zip(Self::flatten(window))
                .map(|(w, v)| w * v)
                .sum::<f64>();

        if !prediction.is_finite() {
            return Err(PipelineError::Defect(format!(
                "non-finite prediction {}",
                prediction
            )));
        }
        Ok(prediction)
    }
}

/// Solve the symmetric normal equations
///
/// Cholesky when the system is positive definite. A singular system (constant
/// or collinear inputs with no penalty) falls back to the SVD least-squares
/// solution, which gives redundant directions zero weight.
fn solve(gram: DMatrix<f64>, rhs: &DVector<f64>) -> PipelineResult<DVector<f64>> {
    if let Some(cholesky) = gram.clone().cholesky() {
        return Ok(cholesky.solve(rhs));
    }

    debug!("Normal equations not positive definite, using SVD");
    gram.svd(true, true)
        .solve(rhs, SINGULAR_EPS)
        .map_err(|e| PipelineError::Defect(format!("ridge solve failed: {}", e)))
}

/// A fitted predictor together with the scaler and schema it was fitted on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel<P = RidgeRegressor> {
    pub predictor: P,
    pub scaler: MinMaxScaler,
    pub schema: FeatureSchema,
    pub window_size: usize,
}

impl<P: Predictor> FittedModel<P> {
    pub fn is_ready(&self) -> bool {
        self.predictor.is_fitted() && self.scaler.is_fitted()
    }

    /// Whether this model can score a feature table with `schema`
    pub fn is_compatible(&self, schema: &FeatureSchema) -> bool {
        &self.schema == schema
    }
}

/// Training diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub train_windows: usize,
    pub validation_windows: usize,
    pub train_mse: f64,
    pub validation_mse: Option<f64>,
}

/// Fit `predictor` on a labeled feature table
///
/// Each window of `window_size` scaled rows is paired with the return of the
/// row right after it. The scaler is fit once on the rows that have a target.
/// Windows are split chronologically into train and validation.
pub fn fit_model<P: Predictor>(
    mut predictor: P,
    features: &[FeatureRow],
    window_size: usize,
    config: &ModelConfig,
) -> PipelineResult<(FittedModel<P>, FitSummary)> {
    let needed = window_size + config.min_extra_rows.max(1);
    if window_size == 0 || features.len() < needed {
        return Err(PipelineError::InsufficientData {
            needed,
            available: features.len(),
        });
    }

    let schema = FeatureSchema::for_table(features);
    let matrix = schema.matrix(features)?;
    let labeled = &matrix[..matrix.len() - 1];
    let scaler = MinMaxScaler::fit(labeled)?;
    let scaled = scaler.transform(&matrix)?;

    let mut windows: Vec<&[Vec<f64>]> = Vec::with_capacity(features.len() - window_size);
    let mut targets = Vec::with_capacity(features.len() - window_size);
    for start in 0..(features.len() - window_size) {
        windows.push(&scaled[start..start + window_size]);
        targets.push(features[start + window_size].returns);
    }

    let split = ((windows.len() as f64 * config.train_split) as usize).clamp(1, windows.len());
    predictor.fit(&windows[..split], &targets[..split])?;

    let train_mse = mse(&predictor, &windows[..split], &targets[..split])?;
    let validation_mse = if split < windows.len() {
        Some(mse(&predictor, &windows[split..], &targets[split..])?)
    } else {
        None
    };

    let summary = FitSummary {
        train_windows: split,
        validation_windows: windows.len() - split,
        train_mse,
        validation_mse,
    };
    info!(
        "Fitted {} on {} windows (validation {}), train MSE {:.3e}, validation MSE {:?}",
        predictor.name(),
        summary.train_windows,
        summary.validation_windows,
        summary.train_mse,
        summary.validation_mse
    );

    Ok((
        FittedModel {
            predictor,
            scaler,
            schema,
            window_size,
        },
        summary,
    ))
}

fn mse<P: Predictor>(predictor: &P, windows: &[&[Vec<f64>]], targets: &[f64]) -> PipelineResult<f64> {
    let mut total = 0.0;
    for (window, &target) in windows.iter().zip(targets.iter()) {
        let err = predictor.predict_return(window)? - target;
        total += err * err;
    }
    Ok(total / windows.len().max(1) as f64)
}
