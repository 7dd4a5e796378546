use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    #[error("Connection queue is full")]
    QueueFull,

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Failed to dial {address}: {source}")]
    DialFailure {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Config file I/O, or an I/O error propagated with `?` from a borrowed connection
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PoolError {
    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AcquireTimeout(_) | Self::DialFailure { .. })
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
