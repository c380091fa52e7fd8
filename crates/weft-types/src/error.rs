//! Error taxonomy shared across the engine.
//!
//! [`ErrorCategory`] classifies step failures for retry eligibility;
//! [`RepositoryError`] and [`QueueError`] are the adapter-facing error
//! types returned by the persistence and broker ports.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category assigned to a step failure by substring classification.
///
/// `Timeout`, `NetworkError` and `RateLimit` are retryable by default; the
/// rest are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Timeout,
    NetworkError,
    RateLimit,
    PermissionError,
    NotFound,
    ValidationError,
    QuotaExceeded,
    UnknownError,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::NetworkError => "NETWORK_ERROR",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::PermissionError => "PERMISSION_ERROR",
            ErrorCategory::NotFound => "NOT_FOUND",
            ErrorCategory::ValidationError => "VALIDATION_ERROR",
            ErrorCategory::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCategory::UnknownError => "UNKNOWN_ERROR",
        };
        f.write_str(s)
    }
}

/// Errors from repository operations (used by trait definitions in weft-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from message broker operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker connection error")]
    Connection,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("acknowledge failed: {0}")]
    Ack(String),

    #[error("message payload error: {0}")]
    Payload(String),
}
