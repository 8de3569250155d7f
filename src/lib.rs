//! Regime-aware crypto signals
//!
//! Turns a daily price series into trading signals and scores them: trailing
//! features, a market regime label per row, a windowed return predictor, an
//! adaptive threshold search over its predictions and a lagged backtest of
//! the resulting positions. The pipeline runs one job at a time and publishes
//! complete snapshots for readers.

pub mod config;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod features;
pub mod indicators;
pub mod pipeline;
pub mod predictor;
pub mod regime;
pub mod signals;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{PipelineError, PipelineResult};
pub use types::*;
