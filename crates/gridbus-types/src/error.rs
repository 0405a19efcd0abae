//! Shared error types for the GridBus platform.

use thiserror::Error;

/// Top-level error type for the GridBus platform.
#[derive(Error, Debug)]
pub enum GridBusError {
    /// A frame set failed structural validation.
    #[error("Frame error: {0}")]
    Frame(String),

    /// A transport-level send or receive failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame could not be routed to its recipient.
    #[error("Routing error: {0}")]
    Routing(String),

    /// A protected-topic capability check failed.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Alias for Result with GridBusError.
pub type GridBusResult<T> = Result<T, GridBusError>;
