//! Technical indicators
//!
//! Trailing-window primitives used by the feature engine. Every function reads
//! only values at or before the index it writes, so a value at index `i` never
//! changes when later values are appended or altered.

/// Simple percent change from the previous value. The first element is 0.
///
/// A zero previous value yields 0 rather than an infinite change.
pub fn pct_change(values: &[f64]) -> Vec<f64> {
    let mut result = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if i == 0 || values[i - 1] == 0.0 {
            result.push(0.0);
        } else {
            result.push(values[i] / values[i - 1] - 1.0);
        }
    }

    result
}

/// Calculate Simple Moving Average over full windows only
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if period == 0 || i + 1 < period {
            result.push(None);
        } else {
            let sum: f64 = values[i + 1 - period..=i].iter().sum();
            result.push(Some(sum / period as f64));
        }
    }

    result
}

/// Mean over the last `period` values, or over however many exist when fewer
/// than `period` values are available.
pub fn trailing_mean(values: &[f64], period: usize) -> Vec<f64> {
    let mut result = Vec::with_capacity(values.len());
    let period = period.max(1);

    for i in 0..values.len() {
        let start = (i + 1).saturating_sub(period);
        let window = &values[start..=i];
        result.push(window.iter().sum::<f64>() / window.len() as f64);
    }

    result
}

/// Rolling sample standard deviation (n - 1 denominator) over full windows only
pub fn rolling_std(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if period < 2 || i + 1 < period {
            result.push(None);
            continue;
        }

        let window = &values[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance = window
            .iter()
            .map(|&x| {
                let diff = x - mean;
                diff * diff
            })
            .sum::<f64>()
            / (period - 1) as f64;
        result.push(Some(variance.sqrt()));
    }

    result
}

/// Calculate RSI (Relative Strength Index)
///
/// Average gain and loss are trailing means over up to `period` price deltas
/// (the first delta is 0). A zero average loss is replaced by 1 so the ratio
/// stays finite.
pub fn rsi(values: &[f64], period: usize) -> Vec<f64> {
    let mut gains = Vec::with_capacity(values.len());
    let mut losses = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        let change = if i == 0 { 0.0 } else { values[i] - values[i - 1] };
        gains.push(if change > 0.0 { change } else { 0.0 });
        losses.push(if change < 0.0 { -change } else { 0.0 });
    }

    let avg_gains = trailing_mean(&gains, period);
    let avg_losses = trailing_mean(&losses, period);

    avg_gains
        .iter()
        .zip(avg_losses.iter())
        .map(|(&avg_gain, &avg_loss)| {
            let avg_loss = if avg_loss == 0.0 { 1.0 } else { avg_loss };
            let rs = avg_gain / avg_loss;
            100.0 - (100.0 / (1.0 + rs))
        })
        .collect()
}
