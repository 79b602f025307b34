//! Unified Error Handling System
//!
//! One type-safe error enum, built with `thiserror`, covers every fallible
//! operation in the crate: configuration failures are fatal, while
//! serialize/transport/store failures are absorbed by their callers and
//! surfaced only through counters.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryError {
    /// Raised during `Context::initialize` for a malformed configuration. Fatal.
    #[error("invalid configuration: {field} - {reason}")]
    ConfigInvalid { field: String, reason: String },

    /// An event could not be turned into bytes by the active serializer. Dropped, counted.
    #[error("failed to serialize event {event_name:?}: {reason}")]
    SerializeError { event_name: String, reason: String },

    /// The offline store has no room left for a `put` of this priority.
    #[error("offline store is full: cannot accept priority {priority:?} (reason: {reason})")]
    StoreFull {
        priority: crate::event::Priority,
        reason: String,
    },

    /// A single record exceeded `maxBlobSize` and cannot ever be packaged.
    #[error("record of {size} bytes exceeds maxBlobSize {max_size}")]
    OversizeRecord { size: usize, max_size: usize },

    /// Transport-level failure (DNS, TLS, connect, reset, timeout, decode). Retried with backoff.
    #[error("transport network failure against {endpoint}: {reason}")]
    TransportNetwork { endpoint: String, reason: String },

    /// 4xx other than 408/429. Dropped, counted, no retry.
    #[error("transport permanently rejected request to {endpoint}: status {status}")]
    TransportPermanent { endpoint: String, status: u16 },

    /// Cancelled during teardown. No side effect beyond state cleanup.
    #[error("request {attempt_id} aborted during teardown")]
    Aborted { attempt_id: String },

    /// An item exhausted `maxRetryCount`. Dropped, counted.
    #[error("item {item_id} exceeded max retry count {max_retries}")]
    MaxRetriesExceeded { item_id: u64, max_retries: u32 },

    /// Malformed backoff policy descriptor.
    #[error("invalid backoff policy descriptor {descriptor:?}: {reason}")]
    BackoffPolicyInvalid { descriptor: String, reason: String },

    /// I/O failure persisting or reading the offline store's log file.
    #[error("offline store I/O error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Error category for grouping related errors, e.g. for metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Serialization,
    Store,
    Transport,
    Internal,
}

impl TelemetryError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TelemetryError::ConfigInvalid { .. } | TelemetryError::BackoffPolicyInvalid { .. } => {
                ErrorCategory::Configuration
            }
            TelemetryError::SerializeError { .. } => ErrorCategory::Serialization,
            TelemetryError::StoreFull { .. } | TelemetryError::Io(_) => ErrorCategory::Store,
            TelemetryError::OversizeRecord { .. }
            | TelemetryError::TransportNetwork { .. }
            | TelemetryError::TransportPermanent { .. }
            | TelemetryError::Aborted { .. }
            | TelemetryError::MaxRetriesExceeded { .. } => ErrorCategory::Transport,
            TelemetryError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the transmitter should schedule backoff and retry this error's
    /// underlying attempt, as opposed to dropping the item outright.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TelemetryError::TransportNetwork { .. })
    }
}
