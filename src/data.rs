//! Data loading and management
//!
//! Price series collaborators: CSV files, the CoinGecko market chart API and
//! in-memory series. Every source hands the pipeline a validated, strictly
//! time-ordered series.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{DataConfig, DataSourceKind};
use crate::error::{PipelineError, PipelineResult};
use crate::PricePoint;

// =============================================================================
// Constants
// =============================================================================

const USER_AGENT: &str = concat!("regime-signals/", env!("CARGO_PKG_VERSION"));

// =============================================================================
// Price Sources
// =============================================================================

/// Supplies the time-ordered price series for one pipeline run
pub trait PriceSource: Send + Sync {
    fn name(&self) -> String;

    fn fetch(&self) -> PipelineResult<Vec<PricePoint>>;
}

/// Fixed in-memory series
#[derive(Debug, Clone)]
pub struct StaticSource {
    series: Vec<PricePoint>,
}

impl StaticSource {
    pub fn new(series: Vec<PricePoint>) -> Self {
        Self { series }
    }
}

impl PriceSource for StaticSource {
    fn name(&self) -> String {
        "static".to_string()
    }

    fn fetch(&self) -> PipelineResult<Vec<PricePoint>> {
        validate_series(&self.series)?;
        Ok(self.series.clone())
    }
}

/// Series stored in a CSV file
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
}

impl CsvSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl PriceSource for CsvSource {
    fn name(&self) -> String {
        format!("csv:{}", self.path.display())
    }

    fn fetch(&self) -> PipelineResult<Vec<PricePoint>> {
        let series = load_csv(&self.path).map_err(|e| PipelineError::Fetch(format!("{:#}", e)))?;
        validate_series(&series)?;
        info!("Loaded {} points from {}", series.len(), self.path.display());
        Ok(series)
    }
}

/// Build the source named by the configuration
pub fn source_from_config(config: &DataConfig) -> Result<Box<dyn PriceSource>> {
    Ok(match config.source {
        DataSourceKind::Csv => Box::new(CsvSource::new(&config.csv_path)),
        DataSourceKind::Coingecko => Box::new(CoinGeckoSource::new(config.clone())?),
    })
}

// =============================================================================
// CSV Data Loading
// =============================================================================

/// Parse a timestamp given as RFC-3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD`
/// or Unix epoch seconds
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(secs) = raw.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0)
            .with_context(|| format!("Epoch seconds out of range: {}", raw));
    }

    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
        .or_else(|_| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d").map(|d| {
                DateTime::<Utc>::from_naive_utc_and_offset(d.and_time(NaiveTime::default()), Utc)
            })
        })
        .with_context(|| format!("Failed to parse timestamp: {}", raw))
}

fn parse_optional(value: Option<&str>, column: &str) -> Result<Option<f64>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => v
            .parse::<f64>()
            .map(Some)
            .with_context(|| format!("Failed to parse {}", column)),
    }
}

/// Load a price series from CSV
///
/// Expected header: `timestamp,price[,volume[,market_cap]]`. Empty optional
/// cells are read as missing.
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<PricePoint>> {
    let mut reader = csv::Reader::from_path(path.as_ref()).context("Failed to open CSV file")?;

    let mut series = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.context(format!("Failed to read row {}", row_idx + 1))?;

        let timestamp = parse_timestamp(record.get(0).context("Missing timestamp column")?)?;
        let price: f64 = record
            .get(1)
            .context("Missing price column")?
            .trim()
            .parse()
            .context("Failed to parse price")?;
        let volume = parse_optional(record.get(2), "volume")?;
        let market_cap = parse_optional(record.get(3), "market_cap")?;

        series.push(PricePoint {
            timestamp,
            price,
            volume,
            market_cap,
        });
    }

    Ok(series)
}

/// Save a price series to CSV
pub fn save_csv(series: &[PricePoint], path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path).context("Failed to create output file")?;

    writeln!(file, "timestamp,price,volume,market_cap")?;

    for point in series {
        writeln!(
            file,
            "{},{},{},{}",
            point.timestamp.to_rfc3339(),
            point.price,
            point.volume.map(|v| v.to_string()).unwrap_or_default(),
            point.market_cap.map(|v| v.to_string()).unwrap_or_default()
        )?;
    }

    info!("Saved {} rows to {}", series.len(), path.display());
    Ok(path.to_path_buf())
}

// =============================================================================
// CoinGecko Fetcher
// =============================================================================

#[derive(Debug, serde::Deserialize)]
struct MarketChartResponse {
    #[serde(default)]
    prices: Vec<(f64, f64)>,
    #[serde(default)]
    total_volumes: Vec<(f64, f64)>,
    #[serde(default)]
    market_caps: Vec<(f64, f64)>,
}

/// Delay before retry number `attempt` (0-based): `base × 2^attempt`
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// Daily price, volume and market cap history from CoinGecko
pub struct CoinGeckoSource {
    client: reqwest::blocking::Client,
    config: DataConfig,
}

impl CoinGeckoSource {
    pub fn new(config: DataConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!(
            "{}/coins/{}/market_chart?vs_currency={}&days={}&interval=daily",
            self.config.base_url.trim_end_matches('/'),
            self.config.coin, self.config.vs_currency, self.config.days
        )
    }

    /// GET with bounded exponential backoff on 429 and 5xx responses
    fn get_with_retry(&self, url: &str) -> PipelineResult<String> {
        let base = Duration::from_millis(self.config.base_delay_ms);
        let attempts = self.config.max_retries + 1;

        for attempt in 0..attempts {
            let mut request = self.client.get(url);
            if let Some(key) = &self.config.api_key {
                request = request.header("x-cg-demo-api-key", key);
            }

            let response = request
                .send()
                .map_err(|e| PipelineError::Fetch(format!("request failed: {}", e)))?;
            let status = response.status();

            if status.is_success() {
                return response
                    .text()
                    .map_err(|e| PipelineError::Fetch(format!("failed to read body: {}", e)));
            }

            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if !retryable {
                return Err(PipelineError::Fetch(format!("API returned status: {}", status)));
            }
            if attempt + 1 == attempts {
                break;
            }

            let delay = backoff_delay(base, attempt);
            warn!(
                "Request returned {} (attempt {}/{}), retrying in {}ms",
                status,
                attempt + 1,
                attempts,
                delay.as_millis()
            );
            sleep(delay);
        }

        Err(PipelineError::RateLimited { attempts })
    }
}

impl PriceSource for CoinGeckoSource {
    fn name(&self) -> String {
        format!("coingecko:{}", self.config.coin)
    }

    fn fetch(&self) -> PipelineResult<Vec<PricePoint>> {
        info!(
            "Fetching {} days of {} data from CoinGecko",
            self.config.days, self.config.coin
        );
        let body = self.get_with_retry(&self.url())?;
        let chart: MarketChartResponse = serde_json::from_str(&body)
            .map_err(|e| PipelineError::Fetch(format!("failed to parse response: {}", e)))?;

        let series = merge_market_chart(chart);
        validate_series(&series)?;
        info!("Fetched {} data points for {}", series.len(), self.config.coin);
        Ok(series)
    }
}

/// Join prices, volumes and market caps on their millisecond timestamps
fn merge_market_chart(chart: MarketChartResponse) -> Vec<PricePoint> {
    let mut points: BTreeMap<i64, PricePoint> = BTreeMap::new();

    for (ms, price) in chart.prices {
        let ms = ms as i64;
        if let Some(timestamp) = DateTime::from_timestamp_millis(ms) {
            points.insert(ms, PricePoint::new(timestamp, price));
        }
    }
    for (ms, volume) in chart.total_volumes {
        if let Some(point) = points.get_mut(&(ms as i64)) {
            point.volume = Some(volume);
        }
    }
    for (ms, market_cap) in chart.market_caps {
        if let Some(point) = points.get_mut(&(ms as i64)) {
            point.market_cap = Some(market_cap);
        }
    }

    debug!("Merged market chart into {} points", points.len());
    points.into_values().collect()
}

// =============================================================================
// Data Validation
// =============================================================================

/// Reject series that are not strictly time-ordered or carry non-positive or
/// non-finite prices
pub fn validate_series(series: &[PricePoint]) -> PipelineResult<()> {
    for (i, point) in series.iter().enumerate() {
        if !point.price.is_finite() || point.price <= 0.0 {
            return Err(PipelineError::InvalidSeries(format!(
                "point {}: invalid price ({})",
                i, point.price
            )));
        }
        if let Some(volume) = point.volume {
            if !volume.is_finite() || volume < 0.0 {
                return Err(PipelineError::InvalidSeries(format!(
                    "point {}: invalid volume ({})",
                    i, volume
                )));
            }
        }
        if i > 0 && point.timestamp <= series[i - 1].timestamp {
            return Err(PipelineError::InvalidSeries(format!(
                "point {}: timestamp {} not after {}",
                i,
                point.timestamp,
                series[i - 1].timestamp
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
