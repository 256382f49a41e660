use thiserror::Error;

/// Engine-level error. Each variant maps to a stable machine-readable code
/// (see [`BacktestError::code`]); the display text is the human-facing
/// message and may change between versions, the codes may not.
#[derive(Debug, Error)]
pub enum BacktestError {
    /// Bad request shape: unknown factor, invalid expression, inverted date
    /// range, out-of-bounds max_positions. Raised before any work starts.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Price or fundamental data missing for the requested window/universe.
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// External call (DB, broker) failed after exhausting retries.
    #[error("external service failure: {0}")]
    ExternalFailure(String),

    /// Cooperative cancellation was observed.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation inside the engine (cash/position integrity).
    #[error("internal error: {0}")]
    Internal(String),
}

impl BacktestError {
    /// Stable error code, persisted with failed sessions and surfaced on the
    /// progress stream.
    pub fn code(&self) -> &'static str {
        match self {
            BacktestError::Validation(_) => "VALIDATION",
            BacktestError::DataUnavailable(_) => "DATA_UNAVAILABLE",
            BacktestError::ExternalFailure(_) => "EXTERNAL_FAILURE",
            BacktestError::Cancelled => "CANCELLED",
            BacktestError::Internal(_) => "INTERNAL",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BacktestError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, BacktestError>;

impl From<polars::error::PolarsError> for BacktestError {
    fn from(err: polars::error::PolarsError) -> Self {
        BacktestError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for BacktestError {
    fn from(err: anyhow::Error) -> Self {
        BacktestError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(BacktestError::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(
            BacktestError::DataUnavailable("x".into()).code(),
            "DATA_UNAVAILABLE"
        );
        assert_eq!(
            BacktestError::ExternalFailure("x".into()).code(),
            "EXTERNAL_FAILURE"
        );
        assert_eq!(BacktestError::Cancelled.code(), "CANCELLED");
        assert_eq!(BacktestError::Internal("x".into()).code(), "INTERNAL");
    }

    #[test]
    fn cancelled_flag() {
        assert!(BacktestError::Cancelled.is_cancelled());
        assert!(!BacktestError::Validation("x".into()).is_cancelled());
    }
}
