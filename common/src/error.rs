//! Error handling for the weft-common crate.

use std::io;
use thiserror::Error;

/// Common error type for transport, framing and endpoint operations.
///
/// Every variant carries a human readable message and an optional source
/// so that the underlying socket or serde failure stays reachable through
/// `std::error::Error::source`.
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Network operation failed: {message}")]
    NetworkError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Endpoint error: {message}")]
    EndpointError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Serialization failed: {message}")]
    SerializationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Deserialization failed: {message}")]
    DeserializationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Invalid configuration: {message}")]
    ConfigurationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("IO operation failed: {message}")]
    IoError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Timeout occurred: {message}")]
    TimeoutError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

/// Result type alias for common operations.
pub type Result<T> = std::result::Result<T, CommonError>;

/// Retry hints for transport errors.
pub trait Diagnose {
    /// Check if the error is retryable.
    fn is_retryable(&self) -> bool;

    /// Get the recommended retry delay in milliseconds.
    fn retry_delay_ms(&self) -> Option<u64>;
}

impl CommonError {
    /// Create a network error with a custom message.
    pub fn network_error<S: Into<String>>(message: S) -> Self {
        Self::NetworkError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with a custom message and source error.
    pub fn network_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::NetworkError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create an endpoint error with a custom message.
    pub fn endpoint_error<S: Into<String>>(message: S) -> Self {
        Self::EndpointError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a serialization error with a custom message.
    pub fn serialization_error<S: Into<String>>(message: S) -> Self {
        Self::SerializationError {
            message: message.into(),
            source: None,
        }
    }

    /// True if a message could not be encoded, as opposed to a failure of
    /// the connection itself.
    pub fn is_encoding(&self) -> bool {
        matches!(self, Self::SerializationError { .. })
    }

    /// Create a serialization error with a custom message and source error.
    pub fn serialization_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a deserialization error with a custom message and source error.
    pub fn deserialization_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::DeserializationError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a configuration error with a custom message.
    pub fn configuration_error<S: Into<String>>(message: S) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            source: None,
        }
    }

    /// Create an IO error with a custom message and source error.
    pub fn io_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::IoError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a timeout error with a custom message.
    pub fn timeout_error<S: Into<String>>(message: S) -> Self {
        Self::TimeoutError {
            message: message.into(),
            source: None,
        }
    }

    /// Classify a socket-level `io::Error` raised while connecting.
    ///
    /// Refused and missing-path errors mean the peer has not bound yet and
    /// are mapped to retryable network errors.
    pub fn from_connect_error<S: Into<String>>(message: S, error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::AddrNotAvailable => Self::network_error_with_source(message, error),
            _ => Self::io_error_with_source(message, error),
        }
    }
}

impl Diagnose for CommonError {
    fn is_retryable(&self) -> bool {
        match self {
            CommonError::NetworkError { .. } => true,
            CommonError::EndpointError { .. } => false,
            CommonError::SerializationError { .. } => false,
            CommonError::DeserializationError { .. } => false,
            CommonError::ConfigurationError { .. } => false,
            CommonError::IoError { .. } => false,
            CommonError::TimeoutError { .. } => true,
        }
    }

    fn retry_delay_ms(&self) -> Option<u64> {
        if !self.is_retryable() {
            return None;
        }

        match self {
            CommonError::NetworkError { .. } => Some(50),
            CommonError::TimeoutError { .. } => Some(100),
            _ => None,
        }
    }
}
