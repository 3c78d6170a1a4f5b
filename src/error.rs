use thiserror::Error;

use crate::types::{SamplingInterval, Tid, Timestamp};

/// Custom error type for ingestion and compression operations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    /// A source produced a line or field that could not be parsed.
    #[error("Parse error in {source_name} at line {line}: {details}")]
    Parse {
        source_name: String,
        line: usize,
        details: String,
    },

    #[error("Configuration Error: {0}")]
    Configuration(String),

    #[error("A time series group must consist of at least one time series")]
    EmptyGroup,

    #[error("All time series in a group must be either bounded or unbounded")]
    MixedBoundedness,

    #[error("Data point for series {tid} has sampling interval {found}, slice has {expected}")]
    MixedSamplingIntervals {
        expected: SamplingInterval,
        found: SamplingInterval,
        tid: Tid,
    },

    #[error("No segment generator exists for SI: {0}")]
    NoGeneratorForSamplingInterval(SamplingInterval),

    /// The source ended on a configuration event or was advanced past its end.
    #[error("Time series {tid} has no more data points")]
    SourceExhausted { tid: Tid },

    #[error("Time series {tid} is out of order: expected timestamp {expected}, found {found}")]
    OutOfOrder {
        tid: Tid,
        expected: Timestamp,
        found: Timestamp,
    },

    #[error("Segment sink rejected segment: {0}")]
    Sink(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for CoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        CoreError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

impl From<bincode::Error> for CoreError {
    fn from(err: bincode::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
