//! SQLite adapters: persistence repositories and the durable queue.

pub mod broker;
pub mod execution;
pub mod integration;
pub mod pool;
pub mod workflow;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use weft_types::error::RepositoryError;

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC3339 so that string comparison in SQL matches time order
/// (the queue's `available_at` scan relies on it).
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Serialize a serde enum with string representation into its wire form
/// (e.g. `WorkflowStatus::CompletedWithErrors` -> "completed_with_errors").
pub(crate) fn enum_to_str<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!(
            "expected string-serialized enum, got {other}"
        ))),
        Err(e) => Err(RepositoryError::Query(e.to_string())),
    }
}

/// Parse a serde enum from its string wire form.
pub(crate) fn enum_from_str<T: serde::de::DeserializeOwned>(
    s: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid enum value: {s}")))
}
