//! Error types for the gateway.
//!
//! `EncodeError` covers the JSON encoder; `GatewayError` is the main error
//! enum used by everything around it.

use std::collections::TryReserveError;
use thiserror::Error;

/// Errors produced while turning a result set into a JSON document.
#[derive(Error, Debug)]
pub enum EncodeError {
    /// A column descriptor, or its name, could not be read.
    #[error("missing field metadata for column {index}")]
    MissingFieldMetadata { index: usize },

    /// A fetched row does not have one cell per catalog column.
    #[error("row {row} has {actual} cells, expected {expected}")]
    RowShapeMismatch {
        row: usize,
        expected: usize,
        actual: usize,
    },

    /// The output buffer could not grow.
    #[error("could not grow output buffer: {0}")]
    AllocationFailure(#[from] TryReserveError),

    /// A string could not be serialized as JSON.
    #[error("could not serialize string: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Main error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Database connection errors (host unreachable, auth failed, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution errors (syntax errors, timeouts, etc.)
    #[error("Query error: {0}")]
    Query(String),

    /// Configuration errors (invalid config file, rejected query, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed FastCGI traffic.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Result set could not be encoded.
    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),

    /// Socket or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a protocol error with the given message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "Connection Error",
            Self::Query(_) => "Query Error",
            Self::Config(_) => "Configuration Error",
            Self::Protocol(_) => "Protocol Error",
            Self::Encode(_) => "Encoding Error",
            Self::Io(_) => "I/O Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;
