//! Error types for the work manager.

use crate::protocol::RemoteException;
use thiserror::Error;
use weft_common::CommonError;

#[derive(Error, Debug)]
pub enum WorkManagerError {
    /// Bind, connect or framing failure on one of the three channels.
    #[error(transparent)]
    Transport(#[from] CommonError),

    #[error("work manager is already started")]
    AlreadyStarted,

    #[error("work manager is not accepting tasks ({state})")]
    NotAccepting { state: String },

    /// A protocol invariant was violated, e.g. a future resolved twice.
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// The submitted callable raised on the worker.
    #[error("remote task failed: {0}")]
    Remote(RemoteException),

    #[error("startup failed: {message}")]
    Startup {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    /// The task cannot be sent: an argument failed to serialize or the
    /// encoded task exceeds the frame limit.
    #[error("invalid task: {message}")]
    InvalidTask { message: String },

    #[error("timed out: {message}")]
    Timeout { message: String },
}

impl WorkManagerError {
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn startup<S: Into<String>>(message: S) -> Self {
        Self::Startup {
            message: message.into(),
            source: None,
        }
    }

    pub fn startup_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::Startup {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn invalid_task<S: Into<String>>(message: S) -> Self {
        Self::InvalidTask {
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// The remote exception, if this error came from a failed task.
    pub fn remote(&self) -> Option<&RemoteException> {
        match self {
            Self::Remote(exception) => Some(exception),
            _ => None,
        }
    }
}

/// Result type alias for work manager operations.
pub type Result<T> = std::result::Result<T, WorkManagerError>;
