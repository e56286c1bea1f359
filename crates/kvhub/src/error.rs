//! Error types for kvhub.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by a single connection handle or its transport.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error reply (`-ERR ...`).
    #[error("Server error: {0}")]
    Server(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection attempt timed out")]
    ConnectTimeout,

    /// The request was given up on after the per-request retry budget ran out.
    #[error("Reached the max retries per request limit ({attempts} attempts)")]
    MaxRetriesExceeded { attempts: u32 },

    /// The handle reached its terminal state and accepts no more requests.
    #[error("Connection has ended")]
    Ended,
}

impl ClientError {
    /// Whether the error means the connection itself is gone and the request
    /// may succeed on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::ConnectTimeout | Self::Protocol(_)
        )
    }
}

/// Errors raised by the connection registry and the default router.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("No connection registered under '{0}'")]
    NotFound(String),

    #[error("Operation '{0}' is not supported by the connection")]
    UnsupportedOperation(String),

    #[error("Configuration set must contain a 'default' connection")]
    MissingDefault,

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),
}
