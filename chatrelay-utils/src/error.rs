//! Error types for chatrelay
//!
//! Process-level failures: configuration, logging setup and the listening
//! socket. Per-connection failures have their own types in the server crate
//! and never escape a connection task.

use std::path::PathBuf;

/// Main error type for chatrelay operations
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    // === IO Errors ===

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Listener Errors ===

    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(std::io::Error),

    #[error("Invalid listen address {addr}: {message}")]
    InvalidAddress { addr: String, message: String },

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a bind error for `addr`
    pub fn bind(addr: impl ToString, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    /// Check whether the listener can keep running after this error
    ///
    /// Transient accept failures (peer reset before accept, fd pressure) are
    /// logged and retried; everything else stops the relay.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Accept(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Result type alias using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;
