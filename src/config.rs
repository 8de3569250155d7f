//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials and the state directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
///
/// Every section is optional in the file; missing values fall back to the
/// defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signals: SignalConfig,
    pub targets: TargetConfig,
    pub regime: RegimeConfig,
    pub model: ModelConfig,
    pub data: DataConfig,
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env();
        config.validate()?;

        Ok(config)
    }

    /// Load from file when it exists, otherwise use defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let mut config = Config::default();
            config.apply_env();
            Ok(config)
        }
    }

    /// Pull credentials and paths from the environment when set
    pub fn apply_env(&mut self) {
        if let Ok(api_key) = std::env::var("COINGECKO_API_KEY") {
            self.data.api_key = Some(api_key);
        }
        if let Ok(state_dir) = std::env::var("REGIME_SIGNALS_STATE_DIR") {
            self.store.state_dir = state_dir;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.signals;
        if s.window_size == 0 {
            anyhow::bail!("signals.window_size must be at least 1");
        }
        if s.initial_threshold < 0.0 {
            anyhow::bail!("signals.initial_threshold must be >= 0");
        }
        if !(s.threshold_decay > 0.0 && s.threshold_decay < 1.0) {
            anyhow::bail!(
                "signals.threshold_decay must be in (0, 1), got {}",
                s.threshold_decay
            );
        }
        if !(0.0..=1.0).contains(&s.min_signal_rate) {
            anyhow::bail!("signals.min_signal_rate must be a fraction in [0, 1]");
        }
        if !(self.model.train_split > 0.0 && self.model.train_split <= 1.0) {
            anyhow::bail!("model.train_split must be in (0, 1]");
        }
        if self.model.ridge_lambda < 0.0 {
            anyhow::bail!("model.ridge_lambda must be >= 0");
        }
        if self.store.keep_snapshots == 0 {
            anyhow::bail!("store.keep_snapshots must be at least 1");
        }
        if !self.data.base_url.starts_with("http") {
            anyhow::bail!("data.base_url must be an http(s) URL, got {:?}", self.data.base_url);
        }
        Ok(())
    }
}

/// Signal generation and adaptive threshold search
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub window_size: usize,
    pub initial_threshold: f64,
    /// Minimum fraction of rows carrying an active signal
    pub min_signal_rate: f64,
    pub threshold_decay: f64,
    pub max_threshold_attempts: usize,
    /// The search only runs on tables longer than this
    pub min_rows_for_search: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        SignalConfig {
            window_size: 7,
            initial_threshold: 0.001,
            min_signal_rate: 0.03,
            threshold_decay: 0.8,
            max_threshold_attempts: 10,
            min_rows_for_search: 10,
        }
    }
}

/// Performance targets the evaluator checks against
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub sharpe_target: f64,
    pub drawdown_ceiling: f64,
    pub frequency_floor: f64,
    /// Periods per year used to annualize the Sharpe ratio (daily data)
    pub annualization_days: f64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            sharpe_target: 1.8,
            drawdown_ceiling: 0.40,
            frequency_floor: 0.03,
            annualization_days: 252.0,
        }
    }
}

/// Which regime rule labels the feature table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeVariant {
    /// Trailing mean of returns against a symmetric band
    #[default]
    Simple,
    /// Moving-average crossover, returns sign and RSI must all agree
    IndicatorConfirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    pub variant: RegimeVariant,
    pub lookback: usize,
    pub return_threshold: f64,
    /// Rows of history required before the indicator-confirmed rule labels
    pub warmup_rows: usize,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        RegimeConfig {
            variant: RegimeVariant::Simple,
            lookback: 10,
            return_threshold: 0.001,
            warmup_rows: 30,
        }
    }
}

/// Reference predictor fitting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub ridge_lambda: f64,
    /// Chronological share of windows used for training, rest validates
    pub train_split: f64,
    /// Rows required beyond one window before a fit is attempted
    pub min_extra_rows: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            ridge_lambda: 1e-3,
            train_split: 0.8,
            min_extra_rows: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceKind {
    #[default]
    Csv,
    Coingecko,
}

/// Market data collaborator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub source: DataSourceKind,
    pub csv_path: String,
    pub coin: String,
    pub vs_currency: String,
    pub days: u32,
    /// CoinGecko API root
    pub base_url: String,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            source: DataSourceKind::Csv,
            csv_path: "data/bitcoin_1d.csv".to_string(),
            coin: "bitcoin".to_string(),
            vs_currency: "usd".to_string(),
            days: 100,
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            max_retries: 5,
            base_delay_ms: 1000,
            timeout_secs: 30,
            api_key: None,
        }
    }
}

/// Model and run persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub state_dir: String,
    /// Mirror the database to a JSON file after each write
    pub json_backup: bool,
    /// Completed runs whose full snapshot is kept
    pub keep_snapshots: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            state_dir: "state".to_string(),
            json_backup: true,
            keep_snapshots: 5,
        }
    }
}

impl StoreConfig {
    pub fn db_path(&self) -> PathBuf {
        Path::new(&self.state_dir).join("pipeline_state.db")
    }

    pub fn json_path(&self) -> PathBuf {
        Path::new(&self.state_dir).join("pipeline_state.json")
    }
}
