// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per failure class, all convertible into `PulseError`:
// - Validation: malformed input, rejected before any side effect
// - Storage: I/O failure on the durable store, surfaced to the caller
// - Transport: a single subscriber's connection failed
// - Config: invalid startup configuration, fatal
// ============================================================================

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Root Error
// ----------------------------------------------------------------------------

/// The main error type for the engine.
#[derive(Error, Debug)]
pub enum PulseError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PulseError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            PulseError::Validation(_) => false,
            PulseError::Storage(e) => e.is_recoverable(),
            PulseError::Transport(_) => true,
            PulseError::Config(_) => false,
            PulseError::Io(_) => true,
            PulseError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            PulseError::Validation(_) => "validation",
            PulseError::Storage(_) => "storage",
            PulseError::Transport(_) => "transport",
            PulseError::Config(_) => "config",
            PulseError::Io(_) => "io",
            PulseError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            PulseError::Validation(_) => RecoveryHint::Skip,
            PulseError::Storage(e) if !e.is_recoverable() => RecoveryHint::AlertOperator,
            PulseError::Storage(_) => RecoveryHint::RetryWithBackoff,
            PulseError::Transport(_) => RecoveryHint::Reconnect,
            PulseError::Config(_) => RecoveryHint::FixConfiguration,
            PulseError::Io(_) => RecoveryHint::RetryWithBackoff,
            PulseError::Internal(_) => RecoveryHint::AlertOperator,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Reconnect to the peer
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Drop this item and continue
    Skip,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// Validation Errors
// ----------------------------------------------------------------------------

/// Malformed or out-of-range input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("service must be a non-empty identifier")]
    EmptyService,

    #[error("service name is {len} characters, limit is {max}")]
    ServiceTooLong { len: usize, max: usize },

    #[error("value must be finite, got {value}")]
    NonFiniteValue { value: f64 },

    #[error("unknown metric type '{value}'")]
    UnknownMetricType { value: String },

    #[error("unknown aggregation '{value}', expected one of raw, 1m, 5m, 1h")]
    UnknownAggregation { value: String },

    #[error("invalid timestamp '{value}'")]
    InvalidTimestamp { value: String },

    #[error("start_time {start} is after end_time {end}")]
    InvalidTimeRange { start: Timestamp, end: Timestamp },

    #[error("{count} tags given, limit is {max}")]
    TooManyTags { count: usize, max: usize },

    #[error("invalid tag '{key}': {reason}")]
    InvalidTag { key: String, reason: String },

    #[error("malformed request: {message}")]
    Malformed { message: String },
}

impl ValidationError {
    pub fn malformed(message: impl Into<String>) -> Self {
        ValidationError::Malformed {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Storage Errors
// ----------------------------------------------------------------------------

/// Errors related to the durable store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{operation} failed on {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Serialization failed: {message}")]
    SerializationFailed { message: String },

    #[error("Data corruption detected at offset {offset}: {message}")]
    DataCorruption { offset: u64, message: String },

    #[error("Storage worker failed: {message}")]
    WorkerFailed { message: String },

    #[error("Store is closed")]
    Closed,
}

impl StorageError {
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            StorageError::DataCorruption { .. } => false,
            StorageError::Closed => false,
            _ => true,
        }
    }
}

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Errors from subscriber connections and the stream client.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("send to subscriber {subscriber} failed: {message}")]
    SendFailed { subscriber: String, message: String },

    #[error("subscriber {subscriber} exceeded its queue of {capacity} events")]
    QueueOverflow { subscriber: String, capacity: usize },

    #[error("subscriber {subscriber} disconnected")]
    Disconnected { subscriber: String },

    #[error("connection to {url} failed: {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Failed to initialize logging: {message}")]
    LoggingInit { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

pub type PulseResult<T> = Result<T, PulseError>;

pub type ValidationResult<T> = Result<T, ValidationError>;

pub type StorageResult<T> = Result<T, StorageError>;

pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err: PulseError = ValidationError::EmptyService.into();
        assert_eq!(err.category(), "validation");
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::Skip);

        let err: PulseError = StorageError::WorkerFailed {
            message: "join".into(),
        }
        .into();
        assert_eq!(err.category(), "storage");
        assert!(err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::RetryWithBackoff);

        let err: PulseError = ConfigError::invalid_value("buffer.capacity", "must be > 0").into();
        assert_eq!(err.recovery_hint(), RecoveryHint::FixConfiguration);
    }

    #[test]
    fn test_corruption_is_not_recoverable() {
        let err: PulseError = StorageError::DataCorruption {
            offset: 12,
            message: "bad checksum".into(),
        }
        .into();
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::AlertOperator);
    }

    #[test]
    fn test_transport_errors_suggest_reconnect() {
        let err: PulseError = TransportError::Disconnected {
            subscriber: "sub-1".into(),
        }
        .into();
        assert_eq!(err.recovery_hint(), RecoveryHint::Reconnect);
        assert!(err.to_string().contains("sub-1"));
    }
}
