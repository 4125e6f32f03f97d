//! Error types for the grid engine

use thiserror::Error;

/// Errors that can occur while running a symbol engine
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Invalid order parameters: {0}")]
    InvalidOrderParams(String),

    #[error("Insufficient history: have {have} bars, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("Authentication rejected: {0}")]
    Authentication(String),

    #[error("Instrument rules unavailable for {0}")]
    InstrumentRulesUnavailable(String),

    #[error("Reconciliation conflict: untracked order {0}")]
    ReconciliationConflict(u64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Order {oid} not found")]
    OrderNotFound { oid: u64 },

    #[error("Operation failed after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl Error {
    /// Whether the error is transient and worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connectivity(_))
    }

    /// Whether the error is fatal for engine startup
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Error::Authentication(_) | Error::InstrumentRulesUnavailable(_) | Error::InvalidConfig(_)
        )
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
