//! Pipeline error taxonomy

use thiserror::Error;

/// Errors raised by the signal pipeline
///
/// Everything except [`PipelineError::Defect`] is recoverable: the run is
/// reported as failed or degraded and the serving side keeps answering reads.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("insufficient data: need at least {needed} rows, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("signal series has no price attached")]
    MissingPriceColumn,

    #[error("signal series does not line up with the feature table")]
    MissingSignalColumn,

    #[error("signal series is empty")]
    EmptySeries,

    #[error("rate limited by data provider after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("cached model schema mismatch: expected [{expected}], found [{found}]")]
    CacheSchemaMismatch { expected: String, found: String },

    #[error("invalid price series: {0}")]
    InvalidSeries(String),

    #[error("a pipeline run is already in progress")]
    RunInProgress,

    #[error("data fetch failed: {0}")]
    Fetch(String),

    #[error("defect: {0}")]
    Defect(String),
}

impl PipelineError {
    /// Whether the serving process may keep running after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PipelineError::Defect(_))
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
