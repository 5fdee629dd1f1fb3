use std::time::Duration;
use thiserror::Error;

/// Unified error type for repository operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing connection string, unmapped entity, missing primary key, and other
    /// setup problems that no retry can fix
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A filter input could not be converted into a canonical query group
    #[error("Cannot normalize filter at position {position}: {message}")]
    Normalization { position: usize, message: String },

    /// Failure reported by the underlying connection, passed through unchanged
    #[error(transparent)]
    Execution(#[from] sqlx::Error),

    /// The command-level timeout elapsed before the connection answered
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// A column value could not be converted into the requested type
    #[error("Cannot decode column `{column}`: {message}")]
    Decode { column: String, message: String },

    /// Catch-all for non-recoverable errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub(crate) fn normalization(position: usize, message: impl Into<String>) -> Self {
        Error::Normalization {
            position,
            message: message.into(),
        }
    }
}

/// Type alias for repository operation results
pub type Result<T> = std::result::Result<T, Error>;
