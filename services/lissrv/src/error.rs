//! Error handling for the instrument communication service
//!
//! Frame-level conditions (bad checksum, sequence mismatch) are not
//! errors: the protocol handlers express them as acknowledgment bytes.
//! This type covers service-level failures that end a connection attempt
//! or a supervisor operation.

use thiserror::Error;

/// Instrument communication service error type
#[derive(Error, Debug, Clone)]
pub enum LisSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    Io(String),

    /// Protocol violations that end a connection (e.g. unrecognized lead
    /// byte during auto-detection)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection establishment and maintenance errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Link not found in the supervisor registry
    #[error("Link not found: {0}")]
    LinkNotFound(String),

    /// Client-mode reconnect budget exhausted
    #[error("Reconnect attempts exhausted for {0}")]
    ReconnectExhausted(String),
}

/// Result type alias for service operations
pub type Result<T> = std::result::Result<T, LisSrvError>;

impl LisSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}

impl From<std::io::Error> for LisSrvError {
    fn from(e: std::io::Error) -> Self {
        LisSrvError::Io(e.to_string())
    }
}
