use candle_core::DType;
use thiserror::Error;

/// Errors raised by the token-merging core.
///
/// Configuration problems are surfaced eagerly; numerical edge cases such as
/// a block with nothing left to merge are absorbed by clamping and never show
/// up here.
#[derive(Error, Debug)]
pub enum TomeError {
    #[error("invalid merge configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("merge budget {requested} exceeds capacity {capacity}")]
    BudgetExceedsCapacity { requested: usize, capacity: usize },

    #[error(
        "merge ratio solve did not converge: target {target}, closest {best} after {iterations} iterations"
    )]
    RatioDidNotConverge {
        target: usize,
        best: usize,
        iterations: usize,
    },

    #[error("attention did not emit a `{key}` entry")]
    MissingMetric { key: &'static str },

    #[error("attention metric is not numeric (dtype {dtype:?})")]
    MetricNotNumeric { dtype: DType },

    #[error("attention metric has shape {actual:?}, expected [batch, {expected}, channels]")]
    MetricShape { expected: usize, actual: Vec<usize> },

    #[error("merge schedule exhausted at block {block} (schedule has {len} entries)")]
    ScheduleExhausted { block: usize, len: usize },

    #[error("merge schedule not fully consumed: {consumed} of {len} entries")]
    ScheduleNotConsumed { consumed: usize, len: usize },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl TomeError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether this error is a configuration problem rather than a backend
    /// failure.
    pub fn is_config_error(&self) -> bool {
        !matches!(self, Self::Candle(_))
    }
}

pub type Result<T> = std::result::Result<T, TomeError>;
