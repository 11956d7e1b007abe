//! Error types for the metrics agent.

use core::error::Error;

use derive_more::Display;

/// Errors raised while delivering a unit to the collector.
#[derive(Debug, Display)]
pub enum TransportError {
    /// Connection refused, reset, DNS failure, timeout...
    #[display("Network error: {message}")]
    Network { message: String },

    /// Collector answered with a non-success status
    #[display("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    /// Body could not be encoded
    #[display("Serialization error: {message}")]
    Serialization { message: String },

    /// HTTP client could not be built
    #[display("Configuration error: {message}")]
    Configuration { message: String },
}

impl Error for TransportError {}

/// Errors raised by the delivery worker pool.
#[derive(Debug, Display)]
pub enum DispatchError {
    #[display("Delivery queue is closed")]
    QueueClosed,
}

impl Error for DispatchError {}

/// Errors raised by a statistics source during a sampling pass.
#[derive(Debug, Display)]
pub enum SampleError {
    #[display("Source {source_name} is unavailable: {reason}")]
    Unavailable {
        source_name: &'static str,
        reason: String,
    },
}

impl Error for SampleError {}
