//! Error types for the metrics server.

use core::error::Error;

use derive_more::Display;
use metrics_types::MetricKind;

/// Errors raised by a storage backend.
#[derive(Debug, Display)]
pub enum StorageError {
    /// Backend unreachable or busy. Retried with the backoff schedule.
    #[display("Storage connection error: {message}")]
    Connection { message: String },

    /// Statement failed for a reason retrying will not fix.
    #[display("Storage query error: {message}")]
    Query { message: String },

    /// Update of a metric with a kind other than the stored one.
    #[display("Metric {id} is stored as {stored}, update is {requested}")]
    KindMismatch {
        id: String,
        stored: MetricKind,
        requested: MetricKind,
    },

    #[display("Storage serialization error: {message}")]
    Serialization { message: String },
}

impl Error for StorageError {}

impl StorageError {
    /// Whether the failed operation may succeed if attempted again.
    pub fn is_connection(&self) -> bool {
        matches!(self, StorageError::Connection { .. })
    }
}

/// Errors raised while writing or reading the checkpoint file.
#[derive(Debug, Display)]
pub enum CheckpointError {
    #[display("Checkpoint I/O error on {path}: {message}")]
    Io { path: String, message: String },

    #[display("Checkpoint file {path} is malformed: {message}")]
    Malformed { path: String, message: String },

    #[display("Cannot encode checkpoint")]
    Encode,

    #[display("Cannot read store for checkpoint")]
    Store,
}

impl Error for CheckpointError {}

/// Errors raised while serving HTTP requests.
#[derive(Debug, Display)]
pub enum ApiError {
    #[display("Bad request: {message}")]
    BadRequest { message: String },

    #[display("Metric not found: {kind} {id}")]
    NotFound { kind: MetricKind, id: String },

    #[display("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[display("Storage failure: {message}")]
    Storage { message: String },

    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}
