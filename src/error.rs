//! Error types for Synheart Daily

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised while ingesting events or mutating application state.
///
/// Every variant is recoverable: the offending input is discarded and the
/// aggregator keeps serving subsequent calls.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("Invalid activity: {0}")]
    InvalidActivity(String),

    #[error("Invalid sensor reading: {0}")]
    InvalidReading(String),

    #[error("Invalid posture: {0}")]
    InvalidPosture(String),

    #[error("Out-of-order data: reading at {timestamp} is behind latest {latest} (tolerance {tolerance_ms} ms)")]
    OutOfOrderData {
        timestamp: DateTime<Utc>,
        latest: DateTime<Utc>,
        tolerance_ms: i64,
    },

    #[error("Duplicate id {id} in {collection}")]
    DuplicateId { collection: &'static str, id: String },

    #[error("Rollover already in progress")]
    RolloverInProgress,

    #[error("Invalid nudge: {0}")]
    InvalidNudge(String),

    #[error("Unknown nudge: {0}")]
    UnknownNudge(String),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Archive worker unavailable")]
    WorkerUnavailable,

    #[error("Timed out after {0:?} waiting for the archive worker")]
    HandoffTimeout(std::time::Duration),

    #[error("Aggregator is shut down")]
    Closed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to parse input: {0}")]
    ParseError(String),
}

/// Errors raised by a persistence backend
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid archive JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive unavailable: {0}")]
    Unavailable(String),
}
