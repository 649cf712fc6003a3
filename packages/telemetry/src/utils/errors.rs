// packages/telemetry/src/utils/errors.rs
//! Error types for the telemetry pipeline
//!
//! None of these ever escape a capture call. They surface from
//! construction, explicit flushes, storage adapters and transports so the
//! pipeline can decide whether to retry, requeue, or drop.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Telemetry pipeline errors
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Durable store unavailable or corrupt
    #[error("storage error: {0}")]
    Storage(String),

    /// Event (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Collector rejected the batch or the network call failed
    #[error("transport error: {0}")]
    Transport(String),

    /// A send attempt exceeded its deadline
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// Push channel connect/read/write failure
    #[error("push channel error: {0}")]
    Channel(String),

    /// The client has been shut down
    #[error("telemetry client is closed")]
    Closed,
}

impl From<serde_json::Error> for TelemetryError {
    fn from(e: serde_json::Error) -> Self {
        TelemetryError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for TelemetryError {
    fn from(e: rusqlite::Error) -> Self {
        TelemetryError::Storage(e.to_string())
    }
}

impl From<config::ConfigError> for TelemetryError {
    fn from(e: config::ConfigError) -> Self {
        TelemetryError::Config(e.to_string())
    }
}

impl TelemetryError {
    /// Whether a retry of the same operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TelemetryError::Transport(_) | TelemetryError::Timeout(_) | TelemetryError::Channel(_)
        )
    }
}
