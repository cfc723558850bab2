//! Error model for the pure task primitives.

use thiserror::Error;

/// A task payload could not be encoded or decoded.
///
/// Decoding failures are never retried by the worker: a structurally invalid
/// message stays invalid no matter how often it is redelivered.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The bytes were not valid JSON.
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    /// The JSON was valid but not an object.
    #[error("payload must be a json object, got {0}")]
    NotAnObject(&'static str),
}

/// A cron expression failed to parse or validate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronParseError {
    #[error("expected 5 fields (minute hour day month weekday), got {0}")]
    FieldCount(usize),

    #[error("invalid {field} value: {value:?}")]
    InvalidValue { field: &'static str, value: String },

    #[error("{field} value {value} out of range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}
