use thiserror::Error;

#[derive(Debug, Error)]
pub enum BacktestError {
    /// No usable price history for a signal. The signal is skipped.
    #[error("no price data for signal {signal_id} ({symbol}): {reason}")]
    DataGap {
        signal_id: String,
        symbol: String,
        reason: String,
    },

    /// A ledger mutation would break the margin or single-position invariant.
    #[error("ledger invariant violated: {0}")]
    PolicyViolation(String),

    /// A simulation task panicked or returned an unexpected error.
    #[error("worker failed for signal {signal_id}: {reason}")]
    WorkerFailure { signal_id: String, reason: String },

    #[error("result sink write failed after {attempts} attempt(s): {reason}")]
    Persistence { attempts: u32, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl BacktestError {
    pub fn data_gap(signal_id: &str, symbol: &str, reason: impl Into<String>) -> Self {
        BacktestError::DataGap {
            signal_id: signal_id.to_string(),
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }

    /// Errors that abort a whole run rather than a single signal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BacktestError::PolicyViolation(_)
                | BacktestError::Persistence { .. }
                | BacktestError::Config(_)
                | BacktestError::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, BacktestError>;
